//! Error types for the scheduler.

use thiserror::Error;

use crate::TaskId;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The recurrence or retry parameters were rejected at registration.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The durable store could not complete a read or write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The durable record was modified concurrently.
    #[error("version conflict on task {id}: expected {expected}, found {found}")]
    Conflict {
        id: TaskId,
        /// Version the write was based on.
        expected: u64,
        /// Version currently held by the store.
        found: u64,
    },

    /// Task not found.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl SchedulerError {
    /// Whether this is a version conflict that a reload could resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
