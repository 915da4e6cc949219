//! Storage trait abstraction.

use crate::Snapshot;
use async_trait::async_trait;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot written by an incompatible version
    #[error("Unsupported snapshot format {found} (expected {expected})")]
    UnsupportedFormat {
        /// Format found on disk
        found: u32,
        /// Format this build understands
        expected: u32,
    },

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Where coordinator snapshots go.
///
/// Only the latest snapshot matters for recovery; implementations may
/// overwrite older ones.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, replacing the previous one.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load the latest snapshot, if any has been saved.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// How many snapshots have been saved through this store.
    async fn generation(&self) -> Result<u64>;
}
