//! Shared memory for agents.
//!
//! A namespaced, partitioned key/value store with per-entry access levels,
//! TTL expiry and pluggable conflict resolution. Writers never take a
//! global lock; concurrent writes to one key are reconciled by a
//! [`MergePolicy`] so replicas converge.

#![warn(missing_docs)]

pub mod merge;
pub mod query;
pub mod store;

pub use merge::{LastWriterWins, MergePolicy, StructuralMerge};
pub use query::{MemoryQuery, MemoryStats};
pub use store::{MemoryStore, PutRequest, DEFAULT_NAMESPACE};
