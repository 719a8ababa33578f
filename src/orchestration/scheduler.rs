//! Scheduler for parallel subtask execution.
//!
//! The Scheduler owns every status transition. Each iteration it absorbs
//! runtime-registered subtasks, dispatches ready subtasks in topological
//! order up to the concurrency bound, then waits a bounded interval for a
//! worker to finish. Failures are contained: dependents of a failed subtask
//! are resolved as cascade failures in the same iteration and the rest of the
//! graph keeps running.

use crate::config::MAX_WORKERS_CEILING;
use crate::core::graph::TaskGraph;
use crate::core::store::{ResultStore, TaskOutcome};
use crate::core::task::{FailureCause, Subtask, SubtaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::registry::DynamicTaskRegistry;
use crate::orchestration::worker::{panic_message, WorkerOutcome, WorkerRunner};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Settings for one scheduling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Concurrency bound, clamped into `1..=MAX_WORKERS_CEILING`.
    pub max_workers: usize,
    /// Upper bound on one wait for a worker to finish.
    pub poll_interval: Duration,
    /// Maximum loop iterations before the run is abandoned.
    pub max_iterations: u64,
    /// Wall-clock limit for the whole run.
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval: Duration::from_millis(500),
            max_iterations: 10_000,
            run_timeout: None,
        }
    }
}

impl SchedulerConfig {
    /// The concurrency bound actually used.
    pub fn effective_workers(&self) -> usize {
        self.max_workers.clamp(1, MAX_WORKERS_CEILING)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunTermination {
    /// Every subtask finished `Done`.
    Completed,
    /// The run finished with at least one failed subtask.
    Stalled,
    /// The cancellation token fired.
    Cancelled,
    /// The iteration or time budget ran out.
    BudgetExhausted { reason: String },
}

impl RunTermination {
    pub fn is_success(&self) -> bool {
        matches!(self, RunTermination::Completed)
    }
}

impl std::fmt::Display for RunTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunTermination::Completed => write!(f, "completed"),
            RunTermination::Stalled => write!(f, "finished with failures"),
            RunTermination::Cancelled => write!(f, "cancelled"),
            RunTermination::BudgetExhausted { reason } => {
                write!(f, "budget exhausted: {}", reason)
            }
        }
    }
}

/// Events emitted by the scheduler for subtask lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A subtask was handed to a worker.
    TaskStarted { id: SubtaskId },
    /// A worker returned a result.
    TaskCompleted { id: SubtaskId },
    /// A worker failed.
    TaskFailed { id: SubtaskId, error: String },
    /// A pending subtask was resolved as failed without running.
    TaskSkipped { id: SubtaskId, cause: FailureCause },
    /// A worker registered a new subtask.
    TaskSpawned { id: SubtaskId, title: String },
    /// The run ended.
    RunFinished { termination: RunTermination },
}

/// Point-in-time view of the run, published after every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub iteration: u64,
    pub statuses: BTreeMap<SubtaskId, TaskStatus>,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    fn from_statuses(iteration: u64, statuses: &BTreeMap<SubtaskId, TaskStatus>) -> Self {
        let mut snapshot = Self {
            iteration,
            statuses: statuses.clone(),
            ..Self::default()
        };
        for status in statuses.values() {
            match status {
                TaskStatus::Pending => snapshot.pending += 1,
                TaskStatus::Running => snapshot.running += 1,
                TaskStatus::Done => snapshot.done += 1,
                TaskStatus::Failed => snapshot.failed += 1,
            }
        }
        snapshot
    }

    /// Whether every subtask is terminal.
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct SchedulerReport {
    pub termination: RunTermination,
    /// The final graph, including runtime-registered subtasks.
    pub graph: TaskGraph,
    /// One outcome per subtask.
    pub outcomes: ResultStore,
    /// Final status of every subtask; never contains `Pending` or `Running`.
    pub statuses: BTreeMap<SubtaskId, TaskStatus>,
    pub iterations: u64,
    /// Most workers observed running at once.
    pub peak_concurrency: usize,
    pub elapsed: Duration,
}

/// Scheduler for parallel subtask execution.
///
/// # Example
///
/// ```ignore
/// let registry = DynamicTaskRegistry::for_graph(&graph, 10);
/// let runner = WorkerRunner::new(backend, settings, locks, SpawnHandle::new(registry.clone()));
/// let report = Scheduler::new(graph, runner, registry, SchedulerConfig::default())
///     .with_cancellation(token)
///     .run()
///     .await?;
/// ```
pub struct Scheduler {
    graph: TaskGraph,
    runner: WorkerRunner,
    registry: Arc<DynamicTaskRegistry>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    progress: watch::Sender<ProgressSnapshot>,
    statuses: BTreeMap<SubtaskId, TaskStatus>,
    running: HashSet<SubtaskId>,
    /// Worker task id to the subtask it runs.
    tasks: HashMap<task::Id, SubtaskId>,
    done: HashSet<SubtaskId>,
    failed: HashSet<SubtaskId>,
    processed: HashSet<SubtaskId>,
    store: ResultStore,
    peak_concurrency: usize,
}

impl Scheduler {
    pub fn new(
        graph: TaskGraph,
        runner: WorkerRunner,
        registry: Arc<DynamicTaskRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let statuses: BTreeMap<SubtaskId, TaskStatus> = graph
            .order()
            .iter()
            .map(|id| (*id, TaskStatus::Pending))
            .collect();
        let (progress, _) = watch::channel(ProgressSnapshot::from_statuses(0, &statuses));
        Self {
            graph,
            runner,
            registry,
            config,
            cancel: CancellationToken::new(),
            events: None,
            progress,
            statuses,
            running: HashSet::new(),
            tasks: HashMap::new(),
            done: HashSet::new(),
            failed: HashSet::new(),
            processed: HashSet::new(),
            store: ResultStore::new(),
            peak_concurrency: 0,
        }
    }

    /// Use `token` for cooperative cancellation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Emit lifecycle events on `tx`. Events are dropped when it is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Receive a progress snapshot after every iteration.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn status(&self, id: &SubtaskId) -> Option<TaskStatus> {
        self.statuses.get(id).copied()
    }

    /// Whether `subtask` may be dispatched now.
    pub fn is_ready(&self, subtask: &Subtask) -> bool {
        let id = subtask.id;
        !self.done.contains(&id)
            && !self.failed.contains(&id)
            && !self.running.contains(&id)
            && !self.processed.contains(&id)
            && subtask.dependencies.iter().all(|dep| self.done.contains(dep))
    }

    /// Ready subtasks in topological order.
    pub fn ready_ids(&self) -> Vec<SubtaskId> {
        self.graph
            .iter_ordered()
            .filter(|s| self.is_ready(s))
            .map(|s| s.id)
            .collect()
    }

    /// Run the scheduling loop to termination.
    ///
    /// Subtask failures never make this return an error; errors indicate a
    /// broken internal invariant.
    pub async fn run(mut self) -> Result<SchedulerReport> {
        let started = Instant::now();
        let max_workers = self.config.effective_workers();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut iteration: u64 = 0;

        info!(
            subtasks = self.graph.len(),
            max_workers,
            "scheduler starting"
        );
        self.resolve_unsatisfiable()?;

        let termination = loop {
            self.absorb_registered();

            if self.cancel.is_cancelled() {
                break RunTermination::Cancelled;
            }
            if let Some(reason) = self.budget_exceeded(iteration, started) {
                break RunTermination::BudgetExhausted { reason };
            }
            iteration += 1;

            for id in self.ready_ids() {
                if self.running.len() >= max_workers || self.cancel.is_cancelled() {
                    break;
                }
                self.dispatch(id, &mut workers)?;
            }
            self.publish(iteration);

            if workers.is_empty() {
                if self.registry.has_pending() {
                    continue;
                }
                if self.has_pending_subtasks() {
                    self.resolve_pending(
                        FailureCause::Unresolvable,
                        "Skipped: dependencies can never complete",
                    )?;
                }
                break if self.failed.is_empty() {
                    RunTermination::Completed
                } else {
                    RunTermination::Stalled
                };
            }

            let wait = self.wait_interval(started);
            match tokio::time::timeout(wait, workers.join_next_with_id()).await {
                Ok(Some(joined)) => self.joined(joined)?,
                Ok(None) | Err(_) => {}
            }
        };

        match &termination {
            RunTermination::Cancelled => {
                info!(in_flight = workers.len(), "cancelled, waiting for running workers");
                while let Some(joined) = workers.join_next_with_id().await {
                    self.joined(joined)?;
                }
                self.absorb_registered();
                self.resolve_pending(FailureCause::Cancelled, "Cancelled before dispatch")?;
            }
            RunTermination::BudgetExhausted { reason } => {
                warn!(reason = %reason, in_flight = workers.len(), "run budget exhausted");
                workers.abort_all();
                while let Some(joined) = workers.join_next_with_id().await {
                    match joined {
                        // Aborted workers are failed below with the budget cause.
                        Err(e) if e.is_cancelled() => {
                            self.tasks.remove(&e.id());
                        }
                        other => self.joined(other)?,
                    }
                }
                let message = format!("Aborted: {}", reason);
                let aborted: Vec<SubtaskId> = self.running.iter().copied().collect();
                for id in aborted {
                    self.running.remove(&id);
                    self.fail(id, FailureCause::BudgetExhausted, &message)?;
                }
                self.absorb_registered();
                self.resolve_pending(FailureCause::BudgetExhausted, &message)?;
            }
            RunTermination::Completed | RunTermination::Stalled => {}
        }

        self.publish(iteration);
        self.emit(SchedulerEvent::RunFinished {
            termination: termination.clone(),
        });
        info!(
            termination = %termination,
            done = self.done.len(),
            failed = self.failed.len(),
            iterations = iteration,
            "scheduler finished"
        );

        Ok(SchedulerReport {
            termination,
            graph: self.graph,
            outcomes: self.store,
            statuses: self.statuses,
            iterations: iteration,
            peak_concurrency: self.peak_concurrency,
            elapsed: started.elapsed(),
        })
    }

    fn budget_exceeded(&self, iteration: u64, started: Instant) -> Option<String> {
        if iteration >= self.config.max_iterations {
            return Some(format!(
                "iteration limit of {} reached",
                self.config.max_iterations
            ));
        }
        match self.config.run_timeout {
            Some(limit) if started.elapsed() >= limit => {
                Some(format!("run timeout of {:?} exceeded", limit))
            }
            _ => None,
        }
    }

    fn wait_interval(&self, started: Instant) -> Duration {
        match self.config.run_timeout {
            Some(limit) => self
                .config
                .poll_interval
                .min(limit.saturating_sub(started.elapsed())),
            None => self.config.poll_interval,
        }
    }

    fn has_pending_subtasks(&self) -> bool {
        self.statuses.values().any(|s| *s == TaskStatus::Pending)
    }

    /// Move runtime-registered subtasks into the graph.
    fn absorb_registered(&mut self) {
        for subtask in self.registry.drain() {
            let id = subtask.id;
            let title = subtask.title.clone();
            match self.graph.append(subtask) {
                Ok(()) => {
                    debug!(subtask_id = %id, "absorbed registered subtask");
                    self.statuses.insert(id, TaskStatus::Pending);
                    self.emit(SchedulerEvent::TaskSpawned { id, title });
                }
                Err(e) => warn!(subtask_id = %id, error = %e, "rejected registered subtask"),
            }
        }
    }

    fn transition(&mut self, id: SubtaskId, to: TaskStatus) -> Result<()> {
        let from = self
            .statuses
            .get(&id)
            .copied()
            .ok_or(Error::UnknownSubtask(id))?;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { id, from, to });
        }
        self.statuses.insert(id, to);
        Ok(())
    }

    fn dispatch(
        &mut self,
        id: SubtaskId,
        workers: &mut JoinSet<WorkerOutcome>,
    ) -> Result<()> {
        let subtask = self
            .graph
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownSubtask(id))?;
        let dependency_results: Vec<(SubtaskId, String)> = subtask
            .dependencies
            .iter()
            .filter_map(|dep| {
                self.store
                    .done_result(dep)
                    .map(|text| (*dep, text.to_string()))
            })
            .collect();

        self.transition(id, TaskStatus::Running)?;
        self.running.insert(id);
        self.processed.insert(id);
        self.peak_concurrency = self.peak_concurrency.max(self.running.len());

        info!(subtask_id = %id, title = %subtask.title, "dispatching subtask");
        let runner = self.runner.clone();
        let handle = workers.spawn(
            async move { runner.run(&subtask, &dependency_results).await }
                .instrument(info_span!("worker", subtask_id = %id)),
        );
        self.tasks.insert(handle.id(), id);
        self.emit(SchedulerEvent::TaskStarted { id });
        Ok(())
    }

    /// Handle one joined worker task.
    ///
    /// A task that panicked or was cancelled outside a budget abort becomes a
    /// worker failure of its subtask; the run keeps going.
    fn joined(
        &mut self,
        joined: std::result::Result<(task::Id, WorkerOutcome), JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((task_id, outcome)) => {
                let id = self.take_task(task_id)?;
                self.complete(id, outcome)
            }
            Err(e) => {
                let id = self.take_task(e.id())?;
                let message = if e.is_panic() {
                    panic_message(e.into_panic().as_ref())
                } else {
                    e.to_string()
                };
                warn!(subtask_id = %id, error = %message, "worker task crashed");
                self.complete(id, WorkerOutcome::Failed(format!("Worker crashed: {}", message)))
            }
        }
    }

    fn take_task(&mut self, task_id: task::Id) -> Result<SubtaskId> {
        self.tasks
            .remove(&task_id)
            .ok_or_else(|| Error::TaskJoin(format!("no subtask for worker task {}", task_id)))
    }

    /// Record a finished worker.
    fn complete(&mut self, id: SubtaskId, outcome: WorkerOutcome) -> Result<()> {
        self.running.remove(&id);
        let title = self.title_of(id);
        match outcome {
            WorkerOutcome::Done(text) => {
                self.transition(id, TaskStatus::Done)?;
                self.done.insert(id);
                self.registry.record_done(id);
                self.store.record(TaskOutcome::done(id, &title, text))?;
                info!(subtask_id = %id, "subtask done");
                self.emit(SchedulerEvent::TaskCompleted { id });
            }
            WorkerOutcome::Failed(error) => {
                warn!(subtask_id = %id, error = %error, "subtask failed");
                self.emit(SchedulerEvent::TaskFailed {
                    id,
                    error: error.clone(),
                });
                self.fail(id, FailureCause::Worker, &error)?;
                self.cascade()?;
            }
        }
        Ok(())
    }

    fn fail(&mut self, id: SubtaskId, cause: FailureCause, message: &str) -> Result<()> {
        self.transition(id, TaskStatus::Failed)?;
        self.failed.insert(id);
        self.processed.insert(id);
        let title = self.title_of(id);
        self.store
            .record(TaskOutcome::failed(id, &title, message, cause))
    }

    /// Fail every pending subtask that depends on a failed one.
    ///
    /// A single pass in topological order reaches transitive dependents.
    fn cascade(&mut self) -> Result<()> {
        let order: Vec<SubtaskId> = self.graph.order().to_vec();
        for id in order {
            if self.statuses.get(&id) != Some(&TaskStatus::Pending) {
                continue;
            }
            let blocked_by = self
                .graph
                .dependencies_of(&id)
                .iter()
                .find(|dep| self.failed.contains(*dep))
                .copied();
            if let Some(dependency) = blocked_by {
                let cause = FailureCause::Cascade { dependency };
                info!(subtask_id = %id, dependency = %dependency, "cascading failure");
                self.fail(id, cause.clone(), &format!("Skipped: dependency {} failed", dependency))?;
                self.emit(SchedulerEvent::TaskSkipped { id, cause });
            }
        }
        Ok(())
    }

    /// Fail subtasks that depend on an id missing from the graph, then
    /// everything downstream of them. Runs before the first dispatch.
    fn resolve_unsatisfiable(&mut self) -> Result<()> {
        let blocked: Vec<(SubtaskId, SubtaskId)> = self
            .graph
            .unsatisfiable()
            .filter_map(|(id, missing)| missing.first().map(|dep| (id, *dep)))
            .collect();
        if blocked.is_empty() {
            return Ok(());
        }
        for (id, dependency) in blocked {
            warn!(subtask_id = %id, dependency = %dependency, "dependency does not exist");
            self.fail(
                id,
                FailureCause::Unresolvable,
                &format!("Skipped: dependency {} does not exist", dependency),
            )?;
            self.emit(SchedulerEvent::TaskSkipped {
                id,
                cause: FailureCause::Unresolvable,
            });
        }
        self.cascade()
    }

    /// Resolve every still-pending subtask as failed.
    fn resolve_pending(&mut self, cause: FailureCause, message: &str) -> Result<()> {
        let pending: Vec<SubtaskId> = self
            .statuses
            .iter()
            .filter(|(_, status)| **status == TaskStatus::Pending)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            debug!(subtask_id = %id, cause = %cause, "resolving pending subtask");
            self.fail(id, cause.clone(), message)?;
            self.emit(SchedulerEvent::TaskSkipped {
                id,
                cause: cause.clone(),
            });
        }
        Ok(())
    }

    fn title_of(&self, id: SubtaskId) -> String {
        self.graph
            .get(&id)
            .map(|s| s.title.clone())
            .unwrap_or_default()
    }

    fn publish(&self, iteration: u64) {
        self.progress
            .send_replace(ProgressSnapshot::from_statuses(iteration, &self.statuses));
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!("scheduler event dropped");
            }
        }
    }
}
