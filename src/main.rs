use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maestro::config::Config;
use maestro::orchestration::{HeadlessBackend, Orchestrator, SchedulerEvent};
use maestro::Result;

/// Maestro - parallel multi-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG          Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Write log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Plan, execute and summarize a task with parallel workers
    Run {
        /// The task description in natural language
        task: String,

        /// Working directory for the workers
        #[arg(short = 'w', long)]
        workdir: Option<PathBuf>,

        /// Maximum concurrently running workers
        #[arg(long)]
        workers: Option<usize>,

        /// Maximum planned subtasks
        #[arg(long)]
        max_subtasks: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan a task and print the validated execution order
    Plan {
        /// The task description in natural language
        task: String,

        /// Working directory used for project context
        #[arg(short = 'w', long)]
        workdir: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to ~/.maestro/maestro.toml
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    maestro::log::init_with_debug(cli.debug, cli.log_json);

    let config = Config::load()?;
    match cli.command {
        Command::Run {
            task,
            workdir,
            workers,
            max_subtasks,
            json,
        } => {
            let config = apply_overrides(config, workers, max_subtasks);
            run_task(task, workdir, config, json)
        }
        Command::Plan { task, workdir } => run_plan(task, workdir, config),
        Command::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save()?;
                eprintln!("Wrote {}", Config::config_path()?.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Command-line flags take precedence over the config file.
fn apply_overrides(mut config: Config, workers: Option<usize>, max_subtasks: Option<usize>) -> Config {
    if let Some(workers) = workers {
        config.max_workers = workers;
    }
    if let Some(max_subtasks) = max_subtasks {
        config.max_subtasks = max_subtasks;
    }
    config
}

fn resolve_workdir(workdir: Option<PathBuf>) -> Result<PathBuf> {
    match workdir {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

fn run_task(task: String, workdir: Option<PathBuf>, config: Config, json: bool) -> Result<ExitCode> {
    let workdir = resolve_workdir(workdir)?;
    info!(task = %task, workdir = %workdir.display(), "run command");

    let backend = HeadlessBackend::new(&config.command)?.with_timeout(config.worker_timeout());
    let rt = tokio::runtime::Runtime::new()?;

    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                interrupt.cancel();
            }
        });

        let (tx, rx) = mpsc::channel(256);
        let printer = tokio::spawn(print_events(rx, !json));

        let orchestrator = Orchestrator::new(Arc::new(backend), config)
            .with_workdir(workdir)
            .with_cancellation(cancel)
            .with_events(tx);
        let report = orchestrator.run(&task).await;
        drop(orchestrator);
        let _ = printer.await;
        report
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }

    Ok(if report.termination.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

/// Show lifecycle events on stderr while a run is in progress.
async fn print_events(mut rx: mpsc::Receiver<SchedulerEvent>, show: bool) {
    while let Some(event) = rx.recv().await {
        if !show {
            continue;
        }
        match event {
            SchedulerEvent::TaskStarted { id } => eprintln!("  ⚡ [{}] started", id),
            SchedulerEvent::TaskCompleted { id } => eprintln!("  ✅ [{}] done", id),
            SchedulerEvent::TaskFailed { id, error } => eprintln!("  ❌ [{}] failed: {}", id, error),
            SchedulerEvent::TaskSkipped { id, cause } => eprintln!("  ❌ [{}] skipped: {}", id, cause),
            SchedulerEvent::TaskSpawned { id, title } => eprintln!("  ➕ [{}] spawned: {}", id, title),
            SchedulerEvent::RunFinished { termination } => eprintln!("  run {}", termination),
        }
    }
}

fn run_plan(task: String, workdir: Option<PathBuf>, config: Config) -> Result<ExitCode> {
    let workdir = resolve_workdir(workdir)?;
    let backend = HeadlessBackend::new(&config.command)?.with_timeout(config.worker_timeout());
    let rt = tokio::runtime::Runtime::new()?;

    let graph = rt.block_on(async {
        Orchestrator::new(Arc::new(backend), config)
            .with_workdir(workdir)
            .plan(&task)
            .await
    })?;

    println!("Plan ({} subtasks):", graph.len());
    for subtask in graph.iter_ordered() {
        if subtask.dependencies.is_empty() {
            println!("  [{}] {}", subtask.id, subtask.title);
        } else {
            let deps: Vec<String> = subtask.dependencies.iter().map(|d| d.to_string()).collect();
            println!("  [{}] {} (after {})", subtask.id, subtask.title, deps.join(", "));
        }
    }
    Ok(ExitCode::SUCCESS)
}
