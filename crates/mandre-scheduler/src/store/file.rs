//! File-backed task store.
//!
//! One JSON document per task, named `<id>.json`, inside a directory. Writes
//! go to a temporary file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{TaskStore, check_version};
use crate::{SchedulerError, Task, TaskId};

/// Extension of committed records.
const RECORD_EXT: &str = "json";

/// Extension of in-progress writes.
const TEMP_EXT: &str = "json.tmp";

/// Task store persisting records as files in a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Serializes read-check-write sequences within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file task store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &TaskId, ext: &str) -> Result<PathBuf, SchedulerError> {
        let key = id.as_str();
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(SchedulerError::StorageUnavailable(format!(
                "task id '{}' is not a valid storage key",
                key
            )));
        }
        Ok(self.dir.join(format!("{}.{}", key, ext)))
    }

    async fn read_record(path: &Path) -> Result<Option<Task>, SchedulerError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn put(&self, task: &Task) -> Result<(), SchedulerError> {
        let path = self.path_for(&task.id, RECORD_EXT)?;
        let temp = self.path_for(&task.id, TEMP_EXT)?;
        let body = serde_json::to_vec_pretty(task)?;

        let _guard = self.write_lock.lock().await;
        let stored = Self::read_record(&path).await?;
        check_version(stored.map(|t| t.version), task)?;

        tokio::fs::write(&temp, &body).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, SchedulerError> {
        match self.path_for(id, RECORD_EXT) {
            Ok(path) => Self::read_record(&path).await,
            // No record can exist under a key we refuse to write.
            Err(_) => Ok(None),
        }
    }

    async fn delete(&self, id: &TaskId) -> Result<(), SchedulerError> {
        let path = self.path_for(id, RECORD_EXT)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json"));
            if !is_record {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(SchedulerError::Json(e)) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RetryPolicy, TaskSpec};
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn task(raw: u64) -> Task {
        let mut t = Task::from_spec(
            TaskId::from_raw(raw),
            TaskSpec::calendar("digest", "0 9 * * *")
                .with_payload(serde_json::json!({"chat": 42, "text": "morning"})),
            RetryPolicy::default(),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
        .unwrap();
        t.version = 1;
        t
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let original = task(7);
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put(&original).await.unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![original.clone()]);
        assert_eq!(store.get(&original.id).await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut t = task(1);
        store.put(&t).await.unwrap();

        t.version = 5;
        assert!(store.put(&t).await.unwrap_err().is_conflict());

        t.version = 2;
        store.put(&t).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let t = task(3);
        store.put(&t).await.unwrap();
        store.delete(&t.id).await.unwrap();
        store.delete(&t.id).await.unwrap();
        assert!(store.get(&t.id).await.unwrap().is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let mut t = task(1);
        t.id = TaskId::from("../escape");
        assert!(matches!(
            store.put(&t).await,
            Err(SchedulerError::StorageUnavailable(_))
        ));
        assert!(store.get(&t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_skips_corrupt_and_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.put(&task(1)).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"{not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("half.json.tmp"), b"{")
            .await
            .unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
