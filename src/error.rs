use thiserror::Error;

use crate::core::task::{TaskId, TaskSnapshot, TaskStatus};
use crate::core::worker::WorkerId;

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

    #[error("Dependency cycle: task {id} would depend on itself via {path}")]
    Cycle { id: TaskId, path: String },

    #[error("Task already exists: {0}")]
    Duplicate(TaskId),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Stale write on task {id}: store holds {actual}")]
    StaleWrite { id: TaskId, actual: TaskSnapshot },

    #[error("Task {id} already claimed by {owner}")]
    AlreadyClaimed { id: TaskId, owner: WorkerId },

    #[error("Run incomplete: {} task(s) not terminal", .pending.len())]
    IncompleteRun { pending: Vec<TaskId> },

    #[error("Task {id} is not eligible for claiming ({status})")]
    NotEligible { id: TaskId, status: TaskStatus },

    #[error("Invalid transition for task {id} from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Budget exhausted: {spent} of {ceiling} units consumed")]
    BudgetExceeded { spent: u64, ceiling: u64 },

    #[error("Budget checkpoint required: {spent} of {ceiling} units consumed")]
    CheckpointRequired { spent: u64, ceiling: u64 },

    #[error("Sequential fallback active: task {active} is still in flight")]
    SequentialFallback { active: TaskId },

    #[error("Task {id} is held for arbitration of conflict {conflict}")]
    AwaitingArbitration { id: TaskId, conflict: String },

    #[error("Output of task {id} is outside its scope: {subjects:?}")]
    OffScope { id: TaskId, subjects: Vec<String> },

    #[error("Worker {worker} already holds task {task}")]
    WorkerBusy { worker: WorkerId, task: TaskId },

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker has been removed: {0}")]
    WorkerRemoved(WorkerId),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },
}

impl Error {
    /// Errors the calling worker loop recovers from by picking another task.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StaleWrite { .. } | Error::AlreadyClaimed { .. } | Error::NotEligible { .. }
        )
    }

    /// Errors that pause admission of new work without being a fault.
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            Error::BudgetExceeded { .. }
                | Error::CheckpointRequired { .. }
                | Error::SequentialFallback { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
