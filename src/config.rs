use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Hard upper bound on concurrently running workers.
pub const MAX_WORKERS_CEILING: usize = 8;

fn default_command() -> String {
    "claude".to_string()
}
fn default_max_workers() -> usize {
    4
}
fn default_max_subtasks() -> usize {
    crate::core::graph::DEFAULT_MAX_SUBTASKS
}
fn default_max_dynamic_tasks() -> usize {
    10
}
fn default_worker_max_iterations() -> u32 {
    15
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_iterations() -> u64 {
    10_000
}
fn default_worker_timeout_secs() -> u64 {
    600
}
fn default_planner_models() -> Vec<String> {
    vec!["smart".to_string(), "fast".to_string()]
}
fn default_worker_model() -> String {
    "fast".to_string()
}
fn default_aggregator_model() -> String {
    "smart".to_string()
}
fn default_planner_context_chars() -> usize {
    1000
}
fn default_models() -> BTreeMap<String, String> {
    [
        ("fast", "claude-3-5-haiku-latest"),
        ("smart", "claude-sonnet-4-0"),
        ("think", "claude-opus-4-0"),
        ("latest", "claude-sonnet-4-0"),
    ]
    .into_iter()
    .map(|(alias, model)| (alias.to_string(), model.to_string()))
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Headless agent binary used by the default backend.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    #[serde(default = "default_max_dynamic_tasks")]
    pub max_dynamic_tasks: usize,
    #[serde(default = "default_worker_max_iterations")]
    pub worker_max_iterations: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Wall-clock limit for the whole scheduling loop, unbounded when unset.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Planner models tried in order until one yields a usable plan.
    #[serde(default = "default_planner_models")]
    pub planner_models: Vec<String>,
    #[serde(default = "default_worker_model")]
    pub worker_model: String,
    #[serde(default = "default_aggregator_model")]
    pub aggregator_model: String,
    #[serde(default = "default_planner_context_chars")]
    pub planner_context_chars: usize,
    /// Short model aliases mapped to full model names.
    #[serde(default = "default_models")]
    pub models: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: default_command(),
            max_workers: default_max_workers(),
            max_subtasks: default_max_subtasks(),
            max_dynamic_tasks: default_max_dynamic_tasks(),
            worker_max_iterations: default_worker_max_iterations(),
            poll_interval_ms: default_poll_interval_ms(),
            max_iterations: default_max_iterations(),
            run_timeout_secs: None,
            worker_timeout_secs: default_worker_timeout_secs(),
            planner_models: default_planner_models(),
            worker_model: default_worker_model(),
            aggregator_model: default_aggregator_model(),
            planner_context_chars: default_planner_context_chars(),
            models: default_models(),
        }
    }
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.log"))
    }

    /// Resolve a model alias, passing unknown names through unchanged.
    pub fn resolve_model<'a>(&'a self, name: &'a str) -> &'a str {
        self.models.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    /// Scheduler settings derived from this configuration.
    ///
    /// `max_workers` is passed through; the scheduler clamps it into
    /// `1..=MAX_WORKERS_CEILING`.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.max_workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_iterations: self.max_iterations,
            run_timeout: self.run_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            command = %config.command,
            max_workers = config.max_workers,
            max_subtasks = config.max_subtasks,
            "config loaded"
        );
        Ok(config)
    }

    /// Write to `~/.maestro/maestro.toml`, creating the directory if needed.
    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::maestro_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating maestro directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
