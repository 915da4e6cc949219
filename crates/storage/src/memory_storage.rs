//! In-process snapshot storage.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, Snapshot, SnapshotStore};

/// Keeps the latest snapshot in memory. Useful for tests and for running
/// without a state directory.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    inner: Mutex<(Option<Snapshot>, u64)>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.0 = Some(snapshot.clone());
        inner.1 += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock().await;
        if let Some(snapshot) = &inner.0 {
            snapshot.check_format()?;
        }
        Ok(inner.0.clone())
    }

    async fn generation(&self) -> Result<u64> {
        Ok(self.inner.lock().await.1)
    }
}
