//! Isolated execution of a single subtask.
//!
//! Each worker gets a fresh context built only from the overall task, its own
//! subtask and the results of its completed dependencies. The runner reports
//! one [`WorkerOutcome`]; it never changes subtask status itself.

use crate::core::task::{Subtask, SubtaskId};
use crate::error::Error;
use crate::orchestration::backend::{AgentBackend, WorkerRequest};
use crate::orchestration::locks::ResourceLocks;
use crate::orchestration::registry::SpawnHandle;
use crate::orchestration::usage::UsageTracker;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on agent turns per worker.
pub const DEFAULT_WORKER_MAX_ITERATIONS: u32 = 15;

/// What a worker reports back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done(String),
    Failed(String),
}

impl WorkerOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, WorkerOutcome::Done(_))
    }
}

/// Settings shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// The overall task being orchestrated.
    pub task: String,
    /// Base system prompt (working directory and project context).
    pub base_system: String,
    /// Full model name for workers.
    pub model: String,
    pub max_iterations: u32,
    /// Per-worker wall-clock limit.
    pub timeout: Option<Duration>,
    pub workdir: PathBuf,
}

impl WorkerSettings {
    pub fn new(task: &str, model: &str) -> Self {
        Self {
            task: task.to_string(),
            base_system: String::new(),
            model: model.to_string(),
            max_iterations: DEFAULT_WORKER_MAX_ITERATIONS,
            timeout: None,
            workdir: PathBuf::from("."),
        }
    }
}

/// Runs subtasks against an [`AgentBackend`].
///
/// Cheap to clone; every clone shares the backend, settings, locks, usage
/// tracker and the spawn handle.
#[derive(Clone)]
pub struct WorkerRunner {
    backend: Arc<dyn AgentBackend>,
    settings: Arc<WorkerSettings>,
    locks: Arc<ResourceLocks>,
    usage: Arc<UsageTracker>,
    spawn: SpawnHandle,
}

impl WorkerRunner {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        settings: WorkerSettings,
        locks: Arc<ResourceLocks>,
        spawn: SpawnHandle,
    ) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            locks,
            usage: Arc::new(UsageTracker::new()),
            spawn,
        }
    }

    /// Record worker usage on `usage` instead of a private tracker.
    pub fn with_usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Build the isolated request for `subtask`.
    ///
    /// `dependency_results` holds the result text of each completed
    /// dependency, in declared dependency order.
    pub fn request_for(
        &self,
        subtask: &Subtask,
        dependency_results: &[(SubtaskId, String)],
    ) -> WorkerRequest {
        WorkerRequest {
            subtask_id: subtask.id,
            title: subtask.title.clone(),
            system: worker_system_prompt(&self.settings, subtask, dependency_results),
            prompt: format!("Please complete this subtask:\n\n{}", subtask.description),
            model: self.settings.model.clone(),
            max_iterations: self.settings.max_iterations,
            workdir: self.settings.workdir.clone(),
            locks: Arc::clone(&self.locks),
            usage: Arc::clone(&self.usage),
        }
    }

    /// Execute `subtask` and report its outcome.
    ///
    /// Backend errors, timeouts and panics all become
    /// [`WorkerOutcome::Failed`].
    pub async fn run(
        &self,
        subtask: &Subtask,
        dependency_results: &[(SubtaskId, String)],
    ) -> WorkerOutcome {
        let request = self.request_for(subtask, dependency_results);
        let spawn = self.spawn.for_subtask(subtask.id);
        debug!(subtask_id = %subtask.id, deps = dependency_results.len(), "worker starting");

        // The backend call is made inside the guard so a panic while building
        // its future is contained too.
        let backend = Arc::clone(&self.backend);
        let timeout = self.settings.timeout;
        let guarded = AssertUnwindSafe(async move {
            let call = backend.execute(request, spawn);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => call.await,
            }
        })
        .catch_unwind();

        match guarded.await {
            Ok(Ok(text)) => WorkerOutcome::Done(text),
            Ok(Err(e)) => {
                warn!(subtask_id = %subtask.id, error = %e, "worker failed");
                WorkerOutcome::Failed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(subtask_id = %subtask.id, panic = %message, "worker crashed");
                WorkerOutcome::Failed(format!("Worker crashed: {}", message))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The worker's system prompt.
pub fn worker_system_prompt(
    settings: &WorkerSettings,
    subtask: &Subtask,
    dependency_results: &[(SubtaskId, String)],
) -> String {
    let mut system = String::new();
    if !settings.base_system.is_empty() {
        system.push_str(&settings.base_system);
        system.push_str("\n\n");
    }
    system.push_str(&format!(
        "## Orchestration Context\n\
         You are Worker #{} in a multi-agent orchestration system.\n\
         Overall task: {}\n\
         Your specific subtask: {}\n",
        subtask.id, settings.task, subtask.title
    ));

    if !dependency_results.is_empty() {
        system.push_str("\n## Results from prerequisite subtasks:\n");
        for (id, result) in dependency_results {
            system.push_str(&format!("\n### Subtask {} result:\n{}\n", id, result));
        }
    }

    system.push_str(
        "\n## Spawning additional workers\n\
         If you discover work outside your subtask that must also be done, use the \
         `spawn_worker` tool, or print a line of the form\n\
         spawn_worker {\"title\": \"...\", \"description\": \"...\", \"context\": \"...\"}\n\
         The new worker starts after every subtask completed so far.\n",
    );
    system
}
