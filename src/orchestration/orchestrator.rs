//! The end-to-end pipeline: plan, schedule, aggregate.

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::store::TaskOutcome;
use crate::core::task::Subtask;
use crate::error::{Error, Result};
use crate::orchestration::backend::{AgentBackend, AggregateRequest};
use crate::orchestration::context::{load_project_context, system_prompt};
use crate::orchestration::locks::ResourceLocks;
use crate::orchestration::plan::request_plan;
use crate::orchestration::registry::{DynamicTaskRegistry, SpawnHandle};
use crate::orchestration::scheduler::{RunTermination, Scheduler, SchedulerEvent};
use crate::orchestration::usage::{UsageTotals, UsageTracker};
use crate::orchestration::worker::{WorkerRunner, WorkerSettings};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// System prompt for the aggregation call.
pub const AGGREGATOR_SYSTEM: &str = "You are an expert at synthesizing results from parallel worker agents.

You will receive the original task and the results from multiple worker agents that each handled a subtask.
Your job is to:
1. Synthesize a clear, concise summary of what was accomplished
2. Highlight any conflicts, issues, or incomplete work
3. Suggest follow-up steps if needed

Be direct and actionable.";

/// Result of a full orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorReport {
    pub run_id: Uuid,
    pub task: String,
    pub termination: RunTermination,
    /// Every subtask in dependency order, including runtime-registered ones.
    pub subtasks: Vec<Subtask>,
    /// One outcome per subtask, in ascending id order.
    pub outcomes: Vec<TaskOutcome>,
    /// Aggregated summary, or the fallback report when aggregation failed.
    pub summary: String,
    pub aggregation_failed: bool,
    pub iterations: u64,
    pub elapsed_ms: u64,
    /// Agent usage recorded on the orchestrator's tracker.
    pub usage: UsageTotals,
}

impl OrchestratorReport {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    /// Human-readable report for the terminal.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} completed / {} failed ({})\n\n{}\n\nSubtasks:\n",
            self.completed(),
            self.failed(),
            self.termination,
            self.summary.trim_end()
        );
        for outcome in &self.outcomes {
            let mark = if outcome.is_done() { "✅" } else { "❌" };
            out.push_str(&format!("  {} [{}] {}", mark, outcome.id, outcome.title));
            if let Some(cause) = &outcome.cause {
                out.push_str(&format!(" ({})", cause));
            }
            out.push('\n');
        }
        out.push_str(&format!("\nUsage: {}\n", self.usage.summary()));
        out
    }
}

/// Build the aggregator input: the task and every outcome in id order.
pub fn aggregation_input(task: &str, outcomes: &[TaskOutcome]) -> String {
    let mut content = format!("Original task: {}\n\nWorker results:\n\n", task);
    for outcome in outcomes {
        let mark = if outcome.is_done() { "✅" } else { "❌" };
        content.push_str(&format!(
            "## {} Subtask {}: {}\n{}\n\n",
            mark, outcome.id, outcome.title, outcome.result
        ));
    }
    content
}

/// Drives one task through planning, scheduling and aggregation.
pub struct Orchestrator {
    backend: Arc<dyn AgentBackend>,
    config: Config,
    workdir: PathBuf,
    locks: Arc<ResourceLocks>,
    usage: Arc<UsageTracker>,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn AgentBackend>, config: Config) -> Self {
        Self {
            backend,
            config,
            workdir: PathBuf::from("."),
            locks: Arc::new(ResourceLocks::new()),
            usage: Arc::new(UsageTracker::new()),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_locks(mut self, locks: Arc<ResourceLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Record agent usage on a shared tracker.
    pub fn with_usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn base_system(&self) -> String {
        let project = load_project_context(&self.workdir);
        system_prompt(&self.workdir, project.as_deref())
    }

    /// Plan `task` into a validated graph without running it.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty task and
    /// [`Error::CyclicDependency`] for a cyclic plan.
    pub async fn plan(&self, task: &str) -> Result<TaskGraph> {
        let base_system = self.base_system();
        self.plan_with(task, &base_system).await
    }

    async fn plan_with(&self, task: &str, base_system: &str) -> Result<TaskGraph> {
        if task.trim().is_empty() {
            return Err(Error::Validation("task description is empty".to_string()));
        }
        let candidates = request_plan(
            self.backend.as_ref(),
            &self.config,
            task,
            base_system,
            &self.workdir,
            &self.usage,
        )
        .await;
        let graph = TaskGraph::build(candidates, task, self.config.max_subtasks)?;
        info!(
            subtasks = graph.len(),
            dependencies = graph.dependency_count(),
            "plan validated"
        );
        Ok(graph)
    }

    /// Run `task` end to end.
    ///
    /// Subtask failures are reported in the result; only planning errors
    /// (empty task, cyclic plan) and internal errors are returned as `Err`.
    pub async fn run(&self, task: &str) -> Result<OrchestratorReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_inner(run_id, task).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, task: &str) -> Result<OrchestratorReport> {
        info!(task, workdir = %self.workdir.display(), "orchestration starting");
        let base_system = self.base_system();
        let graph = self.plan_with(task, &base_system).await?;

        let registry = DynamicTaskRegistry::for_graph(&graph, self.config.max_dynamic_tasks);
        let settings = WorkerSettings {
            task: task.to_string(),
            base_system,
            model: self.config.resolve_model(&self.config.worker_model).to_string(),
            max_iterations: self.config.worker_max_iterations,
            timeout: Some(self.config.worker_timeout()),
            workdir: self.workdir.clone(),
        };
        let runner = WorkerRunner::new(
            Arc::clone(&self.backend),
            settings,
            Arc::clone(&self.locks),
            SpawnHandle::new(Arc::clone(&registry)),
        )
        .with_usage(Arc::clone(&self.usage));

        let mut scheduler = Scheduler::new(graph, runner, registry, self.config.scheduler_config())
            .with_cancellation(self.cancel.clone());
        if let Some(tx) = &self.events {
            scheduler = scheduler.with_events(tx.clone());
        }
        let report = scheduler.run().await?;

        let subtasks: Vec<Subtask> = report.graph.iter_ordered().cloned().collect();
        let outcomes = report.outcomes.into_outcomes();
        let (summary, aggregation_failed) = self.aggregate(task, &outcomes).await;

        Ok(OrchestratorReport {
            run_id,
            task: task.to_string(),
            termination: report.termination,
            subtasks,
            outcomes,
            summary,
            aggregation_failed,
            iterations: report.iterations,
            elapsed_ms: u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            usage: self.usage.totals(),
        })
    }

    /// Aggregate outcomes, falling back to the raw results on failure.
    async fn aggregate(&self, task: &str, outcomes: &[TaskOutcome]) -> (String, bool) {
        let prompt = aggregation_input(task, outcomes);
        let request = AggregateRequest {
            task: task.to_string(),
            outcomes: outcomes.to_vec(),
            system: AGGREGATOR_SYSTEM.to_string(),
            prompt: prompt.clone(),
            model: self
                .config
                .resolve_model(&self.config.aggregator_model)
                .to_string(),
            workdir: self.workdir.clone(),
            usage: Arc::clone(&self.usage),
        };
        info!("aggregating results");
        match self.backend.aggregate(&request).await {
            Ok(summary) => (summary, false),
            Err(e) => {
                warn!(error = %e, "aggregation failed, returning individual results");
                (
                    format!("Aggregation failed: {}\n\nIndividual results:\n{}", e, prompt),
                    true,
                )
            }
        }
    }
}
