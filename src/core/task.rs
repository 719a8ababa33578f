//! Subtask data model for the orchestration graph.
//!
//! Subtasks are the atomic units of work handed to workers. A subtask itself
//! is immutable once it is part of the graph; its lifecycle status is owned
//! by the scheduler and tracked separately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a subtask within one orchestration run.
///
/// Identifiers are positive, assigned monotonically and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubtaskId(pub u64);

impl SubtaskId {
    /// The identifier used for the synthetic single-subtask plan.
    pub const FIRST: SubtaskId = SubtaskId(1);

    /// Whether this identifier is usable (identifiers start at 1).
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// The identifier following this one.
    pub fn next(&self) -> SubtaskId {
        SubtaskId(self.0 + 1)
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubtaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a subtask.
///
/// `Pending -> Running -> Done | Failed`. A pending subtask may also be
/// resolved straight to `Failed` when it can never run (cascade, cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet dispatched.
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Worker returned a result.
    Done,
    /// Worker failed, or the subtask can never run.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Check if the status is terminal (`Done` or `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a subtask ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureCause {
    /// The worker call returned an error, timed out or crashed.
    Worker,
    /// A dependency failed, so this subtask can never become ready.
    Cascade {
        /// The failed dependency that blocked this subtask.
        dependency: SubtaskId,
    },
    /// A dependency never reached a terminal state the run could use.
    Unresolvable,
    /// The run was cancelled before the subtask was dispatched.
    Cancelled,
    /// The run's iteration or time budget ran out.
    BudgetExhausted,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Worker => write!(f, "worker failure"),
            FailureCause::Cascade { dependency } => {
                write!(f, "dependency {} failed", dependency)
            }
            FailureCause::Unresolvable => write!(f, "unresolvable dependencies"),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::BudgetExhausted => write!(f, "budget exhausted"),
        }
    }
}

/// Where a subtask came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum SubtaskOrigin {
    /// Produced by the planner.
    Planned,
    /// Substituted for an empty or unusable plan.
    Synthetic,
    /// Registered at runtime by a worker.
    Spawned {
        /// The subtask whose worker requested it, if known.
        by: Option<SubtaskId>,
    },
}

/// A unit of work in the orchestration graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier.
    pub id: SubtaskId,
    /// Short label.
    pub title: String,
    /// Task payload for the worker.
    pub description: String,
    /// Subtasks that must be `Done` before this one may run, in declared order.
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
    /// Where this subtask came from.
    pub origin: SubtaskOrigin,
    /// When the subtask was created.
    pub created_at: DateTime<Utc>,
}

/// Maximum number of characters of the task text used as a synthetic title.
pub const SYNTHETIC_TITLE_CHARS: usize = 60;

impl Subtask {
    /// Create a planned subtask without dependencies.
    pub fn new(id: impl Into<SubtaskId>, title: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            dependencies: Vec::new(),
            origin: SubtaskOrigin::Planned,
            created_at: Utc::now(),
        }
    }

    /// Set the dependency list.
    pub fn with_dependencies<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<SubtaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: SubtaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// The single subtask that covers a whole task when no usable plan exists.
    pub fn synthetic(task_description: &str) -> Self {
        let title: String = task_description
            .chars()
            .take(SYNTHETIC_TITLE_CHARS)
            .collect();
        Self::new(SubtaskId::FIRST, &title, task_description)
            .with_origin(SubtaskOrigin::Synthetic)
    }

    /// Check if this subtask has no dependencies.
    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }
}
