//! Structured logging for debugging maestro.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a run from completing
//! - WARN: Recoverable surprises (plan repairs, worker failures, fallbacks)
//! - INFO: Run lifecycle (planning, dispatch, completion, termination)
//! - DEBUG: Detailed scheduler traces (readiness scans, registry drains)
//! - TRACE: Raw backend output
//!
//! Debug mode can be enabled with `--debug` flag or `MAESTRO_DEBUG=1` env var.
//! `RUST_LOG` overrides the level filter entirely. Output goes to
//! `~/.maestro/maestro.log` so it never interleaves with the report on stdout.

use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("MAESTRO_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Default filter directive for the given debug setting.
pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        "maestro=debug"
    } else {
        "maestro=info"
    }
}

/// Initialize logging with explicit debug mode and output format.
///
/// The log file is truncated on startup. When no home directory is available
/// logs go to stderr instead. Calling this more than once is harmless.
pub fn init_with_debug(debug: bool, log_json: bool) {
    let debug_enabled = debug || env_debug();
    let env_filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(debug_enabled).into()),
    );

    let (writer, ansi) = match open_log_file() {
        Some(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let result = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

fn open_log_file() -> Option<File> {
    Config::ensure_dirs().ok()?;
    let path = Config::log_path().ok()?;
    File::create(path).ok()
}
