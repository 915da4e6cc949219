//! Snapshot persistence for hivemind.
//!
//! The coordinator periodically captures its full state (agents, tasks,
//! dependency edges, objectives, memory) into a [`Snapshot`] and hands it
//! to a [`SnapshotStore`]. Two backends ship here: JSON files on disk and
//! an in-process store for tests.

#![warn(missing_docs)]

pub mod trait_;
pub mod snapshot;
pub mod json_storage;
pub mod memory_storage;

pub use trait_::{SnapshotStore, StorageError, Result};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
pub use json_storage::JsonSnapshotStore;
pub use memory_storage::InMemorySnapshotStore;
