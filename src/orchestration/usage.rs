//! Token and cost accounting for agent calls.
//!
//! One [`UsageTracker`] is shared by every call of a run. Backends record
//! what each planner, worker and aggregator call consumed, and the
//! orchestrator reports the totals.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// The kind of agent call that consumed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Plan,
    Worker,
    Aggregate,
}

/// Resources consumed by one call, or a sum of calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost as reported by the agent, in US dollars.
    pub cost_usd: f64,
    /// Agent turns taken.
    pub turns: u64,
}

impl Usage {
    /// Usage of a single call.
    pub fn call(input_tokens: u64, output_tokens: u64, cost_usd: f64, turns: u64) -> Self {
        Self {
            calls: 1,
            input_tokens,
            output_tokens,
            cost_usd,
            turns,
        }
    }

    fn add(&mut self, other: &Usage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
        self.turns += other.turns;
    }
}

/// Usage totals of a run, overall and per call kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total: Usage,
    pub plan: Usage,
    pub worker: Usage,
    pub aggregate: Usage,
}

impl UsageTotals {
    /// One-line summary, e.g. `4 calls · 1200↑ 340↓ tokens · $0.0123 · 7 turns`.
    pub fn summary(&self) -> String {
        let total = &self.total;
        format!(
            "{} calls · {}↑ {}↓ tokens · ${:.4} · {} turns",
            total.calls, total.input_tokens, total.output_tokens, total.cost_usd, total.turns
        )
    }
}

/// Shared accumulator of agent usage.
#[derive(Debug, Default)]
pub struct UsageTracker {
    totals: Mutex<UsageTotals>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UsageTotals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add the usage of one call.
    pub fn record(&self, kind: CallKind, usage: Usage) {
        debug!(
            kind = ?kind,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = usage.cost_usd,
            turns = usage.turns,
            "agent usage recorded"
        );
        let mut totals = self.lock();
        totals.total.add(&usage);
        match kind {
            CallKind::Plan => totals.plan.add(&usage),
            CallKind::Worker => totals.worker.add(&usage),
            CallKind::Aggregate => totals.aggregate.add(&usage),
        }
    }

    /// Snapshot of the totals so far.
    pub fn totals(&self) -> UsageTotals {
        *self.lock()
    }
}
