//! Durable task storage.
//!
//! The scheduler needs point lookups, writes, deletes and a full listing at
//! startup. Every call either completes atomically or fails with
//! [`SchedulerError::StorageUnavailable`] or [`SchedulerError::Conflict`].

mod file;
mod memory;

use async_trait::async_trait;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::{SchedulerError, Task, TaskId};

/// Persistence boundary consumed by the scheduler.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Write `task`.
    ///
    /// If a record already exists, `task.version` must be exactly one more
    /// than the stored version, otherwise the write fails with
    /// [`SchedulerError::Conflict`] and nothing changes.
    async fn put(&self, task: &Task) -> Result<(), SchedulerError>;

    /// Read a task by id.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SchedulerError>;

    /// Remove a task. Removing a missing task succeeds.
    async fn delete(&self, id: &TaskId) -> Result<(), SchedulerError>;

    /// Every stored task, in no particular order.
    async fn list_all(&self) -> Result<Vec<Task>, SchedulerError>;
}

/// Check an incoming write against the stored version.
pub(crate) fn check_version(stored: Option<u64>, incoming: &Task) -> Result<(), SchedulerError> {
    match stored {
        Some(found) if incoming.version != found + 1 => Err(SchedulerError::Conflict {
            id: incoming.id.clone(),
            expected: incoming.version.saturating_sub(1),
            found,
        }),
        _ => Ok(()),
    }
}
