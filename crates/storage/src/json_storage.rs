//! JSON file snapshot storage.
//!
//! Keeps the latest snapshot in `snapshot.json` under the root directory,
//! plus a small `snapshot.meta.json` marker holding the generation counter
//! and the time of the last write. Writes go to a temporary file first and
//! are renamed into place, so a crash mid-write leaves the previous
//! snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Result, Snapshot, SnapshotStore};

const SNAPSHOT_FILE: &str = "snapshot.json";
const META_FILE: &str = "snapshot.meta.json";

/// File-based JSON snapshot backend.
pub struct JsonSnapshotStore {
    root: PathBuf,
    // Serializes writers so the meta marker and the snapshot stay in step.
    write_lock: Mutex<()>,
}

impl JsonSnapshotStore {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the snapshot files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    /// Read and increment the generation counter, return the new value.
    async fn bump_generation(&self) -> Result<u64> {
        let generation = read_generation(&self.meta_path()).await? + 1;
        let meta = serde_json::json!({"generation": generation, "updated_at": chrono::Utc::now()});
        write_atomic(&self.meta_path(), serde_json::to_string_pretty(&meta)?.as_bytes()).await?;
        Ok(generation)
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.snapshot_path(), json.as_bytes()).await?;
        let generation = self.bump_generation().await?;
        info!(
            generation,
            tasks = snapshot.tasks.len(),
            agents = snapshot.agents.len(),
            memory = snapshot.memory.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let snapshot: Option<Snapshot> = read_json(&self.snapshot_path()).await?;
        if let Some(snapshot) = &snapshot {
            snapshot.check_format()?;
            debug!(taken_at = %snapshot.taken_at, "Snapshot loaded");
        }
        Ok(snapshot)
    }

    async fn generation(&self) -> Result<u64> {
        read_generation(&self.meta_path()).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_generation(path: &Path) -> Result<u64> {
    let meta: Option<serde_json::Value> = read_json(path).await?;
    Ok(meta
        .and_then(|m| m.get("generation").and_then(|v| v.as_u64()))
        .unwrap_or(0))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use hivemind_core::{Task, TaskSpec, TaskStatus};

    fn snapshot_with_task(name: &str) -> Snapshot {
        let mut snapshot = Snapshot::new();
        let task = Task::from_spec(TaskSpec::new(name), None, 3, 1_000, chrono::Utc::now());
        snapshot.tasks.push(task);
        snapshot
    }

    #[tokio::test]
    async fn test_load_without_save_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert_eq!(store.generation().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path().join("state")).await.unwrap();

        store.save(&snapshot_with_task("build")).await.unwrap();
        store.save(&snapshot_with_task("deploy")).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].name, "deploy");
        assert_eq!(loaded.count(TaskStatus::Pending), 1);
        assert_eq!(store.generation().await.unwrap(), 2);
        assert!(!dir.path().join("state").join("snapshot.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        let mut snapshot = Snapshot::new();
        snapshot.version = 99;
        store.save(&snapshot).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFormat { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("snapshot.json"), b"{not json")
            .await
            .unwrap();

        assert!(matches!(store.load().await, Err(StorageError::Json(_))));
    }
}
