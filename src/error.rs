use thiserror::Error;

use crate::core::task::{SubtaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<SubtaskId> },

    #[error("Subtask not found: {0}")]
    UnknownSubtask(SubtaskId),

    #[error("Subtask already exists: {0}")]
    DuplicateSubtask(SubtaskId),

    #[error("Result already recorded for subtask {0}")]
    DuplicateResult(SubtaskId),

    #[error("Invalid status transition for subtask {id} from {from} to {to}")]
    InvalidTransition {
        id: SubtaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Dynamic task limit reached (max: {max})")]
    SpawnLimit { max: usize },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Executable not found: {0}")]
    BinaryNotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[SubtaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
