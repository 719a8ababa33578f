//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted mock agent backend
//! - Graph and scheduler builders
//! - Temporary project directories

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use maestro::config::Config;
use maestro::core::{Subtask, SubtaskId, TaskGraph};
use maestro::orchestration::{
    AgentBackend, AggregateRequest, CallKind, DynamicTaskRegistry, PlanRequest, ResourceLocks,
    Scheduler, SchedulerConfig, SpawnHandle, Usage, WorkerRequest, WorkerRunner, WorkerSettings,
};
use maestro::{Error, Result};

/// Usage the mock records for each planner call.
pub const PLAN_USAGE: Usage = Usage {
    calls: 1,
    input_tokens: 100,
    output_tokens: 20,
    cost_usd: 0.01,
    turns: 1,
};

/// Usage the mock records for each worker that returns.
pub const WORKER_USAGE: Usage = Usage {
    calls: 1,
    input_tokens: 200,
    output_tokens: 50,
    cost_usd: 0.02,
    turns: 3,
};

/// Usage the mock records for each aggregation call.
pub const AGGREGATE_USAGE: Usage = Usage {
    calls: 1,
    input_tokens: 150,
    output_tokens: 40,
    cost_usd: 0.005,
    turns: 1,
};

/// What the mock does when a given subtask runs.
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    pub delay_ms: u64,
    pub fail: Option<String>,
    pub panic: bool,
    pub hang: bool,
    /// Append a line to this file, relative to the workdir, while holding
    /// its resource lock.
    pub append_to: Option<String>,
    /// `(title, description, context)` registered through the spawn handle.
    pub spawns: Vec<(String, String, Option<String>)>,
}

/// Scripted backend recording every call.
#[derive(Default)]
pub struct MockBackend {
    plans: Mutex<VecDeque<Result<String>>>,
    scripts: HashMap<u64, WorkerScript>,
    default_delay_ms: u64,
    aggregate_error: Option<String>,

    active: AtomicUsize,
    peak: AtomicUsize,
    pub plan_requests: Mutex<Vec<PlanRequest>>,
    pub started: Mutex<Vec<u64>>,
    pub worker_requests: Mutex<Vec<WorkerRequest>>,
    pub acknowledgements: Mutex<Vec<String>>,
    pub aggregate_requests: Mutex<Vec<AggregateRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            default_delay_ms: 10,
            ..Self::default()
        }
    }

    /// Queue a planner response; responses are consumed in order.
    pub fn with_plan(self, raw: &str) -> Self {
        self.plans.lock().unwrap().push_back(Ok(raw.to_string()));
        self
    }

    /// Queue a planner error.
    pub fn with_plan_error(self, message: &str) -> Self {
        self.plans
            .lock()
            .unwrap()
            .push_back(Err(Error::Backend(message.to_string())));
        self
    }

    pub fn with_script(mut self, id: u64, script: WorkerScript) -> Self {
        self.scripts.insert(id, script);
        self
    }

    pub fn with_delay(self, id: u64, delay_ms: u64) -> Self {
        self.with_script(
            id,
            WorkerScript {
                delay_ms,
                ..WorkerScript::default()
            },
        )
    }

    pub fn failing(self, id: u64, message: &str) -> Self {
        self.with_script(
            id,
            WorkerScript {
                fail: Some(message.to_string()),
                ..WorkerScript::default()
            },
        )
    }

    pub fn with_aggregate_error(mut self, message: &str) -> Self {
        self.aggregate_error = Some(message.to_string());
        self
    }

    /// Highest number of workers observed executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started_ids(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }

    pub fn request_for(&self, id: u64) -> Option<WorkerRequest> {
        self.worker_requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.subtask_id == SubtaskId(id))
            .cloned()
    }
}

/// Decrements the active-worker gauge when a worker ends, even on panic.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn plan(&self, request: &PlanRequest) -> Result<String> {
        self.plan_requests.lock().unwrap().push(request.clone());
        request.usage.record(CallKind::Plan, PLAN_USAGE);
        self.plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Backend("no scripted plan".to_string())))
    }

    async fn execute(&self, request: WorkerRequest, spawn: SpawnHandle) -> Result<String> {
        let id = request.subtask_id.0;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(id);
        self.worker_requests.lock().unwrap().push(request.clone());

        let script = self.scripts.get(&id).cloned().unwrap_or_default();
        let delay = if script.delay_ms > 0 {
            script.delay_ms
        } else {
            self.default_delay_ms
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if script.hang {
            std::future::pending::<()>().await;
        }
        if script.panic {
            panic!("mock worker {} panicked", id);
        }
        if let Some(name) = &script.append_to {
            let path = request.workdir.join(name);
            let _lock = request.locks.acquire(name).await;
            let before = std::fs::read_to_string(&path).unwrap_or_default();
            // Yield between read and write so unlocked writers would interleave.
            tokio::time::sleep(Duration::from_millis(1)).await;
            std::fs::write(&path, format!("{}worker {}\n", before, id))?;
        }
        request.usage.record(CallKind::Worker, WORKER_USAGE);
        for (title, description, context) in &script.spawns {
            let ack = spawn.spawn_worker(title, description, context.as_deref());
            self.acknowledgements.lock().unwrap().push(ack);
        }
        if let Some(message) = script.fail {
            return Err(Error::Backend(message));
        }
        Ok(format!("result of {}", id))
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<String> {
        self.aggregate_requests.lock().unwrap().push(request.clone());
        request.usage.record(CallKind::Aggregate, AGGREGATE_USAGE);
        match &self.aggregate_error {
            Some(message) => Err(Error::Backend(message.clone())),
            None => Ok(format!("Summary of {} subtasks", request.outcomes.len())),
        }
    }
}

/// Build a graph from `(id, dependencies)` pairs.
pub fn graph(layout: &[(u64, &[u64])]) -> TaskGraph {
    let subtasks = layout
        .iter()
        .map(|(id, deps)| {
            Subtask::new(*id, &format!("Subtask {}", id), &format!("do part {}", id))
                .with_dependencies(deps.iter().copied())
        })
        .collect();
    TaskGraph::build(subtasks, "integration task", 100).unwrap()
}

/// Scheduler settings with a short poll interval.
pub fn fast_scheduler_config(max_workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_workers,
        poll_interval: Duration::from_millis(5),
        ..SchedulerConfig::default()
    }
}

/// A scheduler wired to `backend`, plus its registry.
pub fn scheduler<B: AgentBackend + 'static>(
    graph: TaskGraph,
    backend: Arc<B>,
    config: SchedulerConfig,
) -> (Scheduler, Arc<DynamicTaskRegistry>) {
    let registry = DynamicTaskRegistry::for_graph(&graph, 10);
    let runner = WorkerRunner::new(
        backend,
        WorkerSettings::new("integration task", "mock-model"),
        Arc::new(ResourceLocks::new()),
        SpawnHandle::new(Arc::clone(&registry)),
    );
    (
        Scheduler::new(graph, runner, Arc::clone(&registry), config),
        registry,
    )
}

/// Configuration for orchestrator tests: fast polling, default limits.
pub fn fast_config() -> Config {
    Config {
        poll_interval_ms: 5,
        ..Config::default()
    }
}

/// Planner output as a JSON document.
pub fn plan_json(layout: &[(u64, &str, &[u64])]) -> String {
    let subtasks: Vec<serde_json::Value> = layout
        .iter()
        .map(|(id, title, deps)| {
            serde_json::json!({
                "id": id,
                "title": title,
                "description": format!("{} in detail", title),
                "dependencies": deps,
            })
        })
        .collect();
    serde_json::json!({ "subtasks": subtasks }).to_string()
}

/// A temporary project directory with the given files.
pub fn project_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp directory");
    for (name, content) in files {
        write_file(dir.path(), name, content);
    }
    dir
}

fn write_file(root: &Path, name: &str, content: &str) {
    std::fs::write(root.join(name), content).expect("Failed to write fixture file");
}
