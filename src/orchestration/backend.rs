//! Seam between the orchestrator and the language-model agents it drives.

use crate::core::store::TaskOutcome;
use crate::core::task::SubtaskId;
use crate::error::Result;
use crate::orchestration::locks::ResourceLocks;
use crate::orchestration::registry::SpawnHandle;
use crate::orchestration::usage::UsageTracker;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// A planning call: decompose `task` into subtasks.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub task: String,
    pub system: String,
    pub prompt: String,
    /// Full model name, aliases already resolved.
    pub model: String,
    pub workdir: PathBuf,
    /// Where the backend records what the call consumed.
    pub usage: Arc<UsageTracker>,
}

/// One isolated worker call. Nothing in it is shared with other workers
/// except the resource locks and the usage tracker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub subtask_id: SubtaskId,
    pub title: String,
    pub system: String,
    pub prompt: String,
    pub model: String,
    /// Upper bound on agent turns for this worker.
    pub max_iterations: u32,
    pub workdir: PathBuf,
    /// Per-path locks for backends that write files in-process.
    pub locks: Arc<ResourceLocks>,
    pub usage: Arc<UsageTracker>,
}

/// The final synthesis call.
#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub task: String,
    /// Every recorded outcome, in ascending subtask id order.
    pub outcomes: Vec<TaskOutcome>,
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub workdir: PathBuf,
    pub usage: Arc<UsageTracker>,
}

/// An agent provider able to plan, execute subtasks and aggregate results.
///
/// Implementations must be cheap to share across concurrently running
/// workers, and should record each call's consumption on the request's
/// usage tracker.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Return raw planner output, expected to hold a `{"subtasks": [...]}`
    /// JSON document.
    async fn plan(&self, request: &PlanRequest) -> Result<String>;

    /// Run one worker to completion and return its final text.
    ///
    /// `spawn` lets the worker register follow-up subtasks while it runs.
    async fn execute(&self, request: WorkerRequest, spawn: SpawnHandle) -> Result<String>;

    /// Synthesize the final summary from all outcomes.
    async fn aggregate(&self, request: &AggregateRequest) -> Result<String>;
}
