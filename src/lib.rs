//! Maestro: the scheduling core of a multi-agent coding orchestrator.
//!
//! A task is planned into a dependency graph of subtasks, the subtasks run
//! on isolated workers in parallel as their dependencies complete, and the
//! outcomes are aggregated into one summary.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
