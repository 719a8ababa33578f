//! Write-once store of subtask outcomes.

use crate::core::task::{FailureCause, SubtaskId, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The terminal outcome of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// The subtask this outcome belongs to.
    pub id: SubtaskId,
    /// Title of the subtask, kept for reporting.
    pub title: String,
    /// Terminal status (`Done` or `Failed`).
    pub status: TaskStatus,
    /// Worker output on success, error text on failure.
    pub result: String,
    /// Why the subtask failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// A successful outcome.
    pub fn done(id: SubtaskId, title: &str, result: impl Into<String>) -> Self {
        Self {
            id,
            title: title.to_string(),
            status: TaskStatus::Done,
            result: result.into(),
            cause: None,
            finished_at: Utc::now(),
        }
    }

    /// A failed outcome.
    pub fn failed(
        id: SubtaskId,
        title: &str,
        error: impl Into<String>,
        cause: FailureCause,
    ) -> Self {
        Self {
            id,
            title: title.to_string(),
            status: TaskStatus::Failed,
            result: error.into(),
            cause: Some(cause),
            finished_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

/// Outcomes keyed by subtask id, iterated in ascending id order.
///
/// Each id is written at most once; the scheduler is the only writer.
#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    outcomes: BTreeMap<SubtaskId, TaskOutcome>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateResult`] if the id already has an outcome, and
    /// [`Error::Validation`] if the status is not terminal.
    pub fn record(&mut self, outcome: TaskOutcome) -> Result<()> {
        if !outcome.status.is_terminal() {
            return Err(Error::Validation(format!(
                "Outcome for subtask {} has non-terminal status {}",
                outcome.id, outcome.status
            )));
        }
        if self.outcomes.contains_key(&outcome.id) {
            return Err(Error::DuplicateResult(outcome.id));
        }
        self.outcomes.insert(outcome.id, outcome);
        Ok(())
    }

    pub fn get(&self, id: &SubtaskId) -> Option<&TaskOutcome> {
        self.outcomes.get(id)
    }

    pub fn contains(&self, id: &SubtaskId) -> bool {
        self.outcomes.contains_key(id)
    }

    /// Result text of a subtask that finished `Done`.
    pub fn done_result(&self, id: &SubtaskId) -> Option<&str> {
        self.outcomes
            .get(id)
            .filter(|o| o.is_done())
            .map(|o| o.result.as_str())
    }

    /// Outcomes in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.values()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_done()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.completed_count()
    }

    /// Consume the store, yielding outcomes in ascending id order.
    pub fn into_outcomes(self) -> Vec<TaskOutcome> {
        self.outcomes.into_values().collect()
    }
}
