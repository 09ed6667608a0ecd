//! In-memory task store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::{TaskStore, check_version};
use crate::{SchedulerError, Task, TaskId};

/// Task store backed by a concurrent map.
///
/// Survives scheduler restarts as long as the store itself is shared (for
/// example through an `Arc`). Supports failure injection so hosts and tests
/// can exercise storage outages.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: DashMap<TaskId, Task>,
    unavailable: AtomicBool,
    failing_puts: DashSet<TaskId>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StorageUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes of one task fail until [`MemoryStore::clear_failures`].
    pub fn fail_puts_for(&self, id: &TaskId) {
        self.failing_puts.insert(id.clone());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
        self.failing_puts.clear();
    }

    /// Overwrite a record without version checks, as an external writer would.
    pub fn insert_raw(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn check_available(&self) -> Result<(), SchedulerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::StorageUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn put(&self, task: &Task) -> Result<(), SchedulerError> {
        self.check_available()?;
        if self.failing_puts.contains(&task.id) {
            return Err(SchedulerError::StorageUnavailable(format!(
                "injected write failure for {}",
                task.id
            )));
        }

        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(mut entry) => {
                check_version(Some(entry.get().version), task)?;
                entry.insert(task.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(task.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SchedulerError> {
        self.check_available()?;
        Ok(self.tasks.get(id).map(|t| t.value().clone()))
    }

    async fn delete(&self, id: &TaskId) -> Result<(), SchedulerError> {
        self.check_available()?;
        self.tasks.remove(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Task>, SchedulerError> {
        self.check_available()?;
        Ok(self.tasks.iter().map(|t| t.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RetryPolicy, TaskSpec};
    use chrono::DateTime;

    fn task(raw: u64) -> Task {
        Task::from_spec(
            TaskId::from_raw(raw),
            TaskSpec::interval("tick", 5),
            RetryPolicy::default(),
            DateTime::from_timestamp(0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let mut t = task(1);
        t.version = 1;
        store.put(&t).await.unwrap();
        assert_eq!(store.get(&t.id).await.unwrap(), Some(t.clone()));

        store.delete(&t.id).await.unwrap();
        assert!(store.get(&t.id).await.unwrap().is_none());
        // Deleting again is fine.
        store.delete(&t.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::new();
        let mut t = task(1);
        t.version = 1;
        store.put(&t).await.unwrap();

        t.version = 2;
        store.put(&t).await.unwrap();

        // Another writer based on version 1.
        let mut stale = t.clone();
        stale.version = 2;
        let err = store.put(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let t = task(1);
        assert!(matches!(
            store.put(&t).await,
            Err(SchedulerError::StorageUnavailable(_))
        ));
        assert!(store.list_all().await.is_err());

        store.clear_failures();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_puts_are_per_task() {
        let store = MemoryStore::new();
        let a = task(1);
        let b = task(2);
        store.fail_puts_for(&a.id);
        assert!(store.put(&a).await.is_err());
        store.put(&b).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
