//! Orchestration layer for the maestro multi-agent system.
//!
//! This module provides the components that drive a task through planning,
//! parallel subtask execution and aggregation: the agent backend seam, the
//! headless CLI backend, the worker runner, the dynamic task registry and
//! the scheduler.

pub mod backend;
pub mod context;
pub mod headless;
pub mod locks;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod scheduler;
pub mod usage;
pub mod worker;

pub use backend::{AgentBackend, AggregateRequest, PlanRequest, WorkerRequest};
pub use headless::HeadlessBackend;
pub use locks::ResourceLocks;
pub use orchestrator::{Orchestrator, OrchestratorReport};
pub use registry::{DynamicTaskRegistry, SpawnHandle};
pub use scheduler::{
    ProgressSnapshot, RunTermination, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerReport,
};
pub use usage::{CallKind, Usage, UsageTotals, UsageTracker};
pub use worker::{WorkerOutcome, WorkerRunner, WorkerSettings};
