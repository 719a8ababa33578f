//! Integration test suite for maestro.
//!
//! These tests drive the scheduler and the full orchestration pipeline
//! against a scripted mock backend. They verify that planning, dispatch,
//! failure containment, dynamic registration and aggregation work together.
//!
//! # Test Categories
//!
//! - `scheduling`: Dispatch order, concurrency bound, final snapshots
//! - `failure`: Worker failures, panics, cascades and budgets
//! - `dynamic`: Runtime-registered subtasks
//! - `end_to_end`: Plan, execute, aggregate through the orchestrator
//!
//! # CI Compatibility
//!
//! No test spawns an agent process or makes network calls. Async tests run
//! with paused tokio time, so delays cost no wall-clock time.

mod fixtures;

mod dynamic;
mod failure;
