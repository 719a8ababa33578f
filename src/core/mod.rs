//! Core domain models for orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: subtasks, the dependency graph and the
//! outcome store.

pub mod graph;
pub mod store;
pub mod task;

pub use graph::{TaskGraph, DEFAULT_MAX_SUBTASKS};
pub use store::{ResultStore, TaskOutcome};
pub use task::{FailureCause, Subtask, SubtaskId, SubtaskOrigin, TaskStatus};
