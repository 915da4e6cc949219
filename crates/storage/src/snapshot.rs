//! Serializable coordinator state.

use chrono::Utc;
use hivemind_core::{Agent, DependencyEdge, MemoryEntry, Objective, Task, TaskStatus, Time};
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// Current on-disk format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Point-in-time copy of everything the coordinator owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: u32,
    /// When the snapshot was taken
    pub taken_at: Time,
    /// Registered agents
    pub agents: Vec<Agent>,
    /// All tasks, including terminal ones not yet purged
    pub tasks: Vec<Task>,
    /// Dependency edges (`from` must finish before `to`)
    pub edges: Vec<DependencyEdge>,
    /// Submitted objectives
    pub objectives: Vec<Objective>,
    /// Shared memory entries
    pub memory: Vec<MemoryEntry>,
}

impl Snapshot {
    /// Create an empty snapshot stamped now.
    pub fn new() -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            taken_at: Utc::now(),
            agents: Vec::new(),
            tasks: Vec::new(),
            edges: Vec::new(),
            objectives: Vec::new(),
            memory: Vec::new(),
        }
    }

    /// Reject snapshots from a different format.
    pub fn check_format(&self) -> Result<()> {
        if self.version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat {
                found: self.version,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(())
    }

    /// Number of tasks with the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}
