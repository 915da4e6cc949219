//! Coordination events - typed state-change notifications.

use crate::agent::AgentStatus;
use crate::id::{AgentId, ObjectiveId, TaskId};
use crate::objective::ObjectiveStatus;
use serde::{Deserialize, Serialize};

/// Subscription key for [`CoordinationEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `objective:submitted`
    ObjectiveSubmitted,
    /// `objective:completed`
    ObjectiveCompleted,
    /// `task:ready`
    TaskReady,
    /// `task:assigned`
    TaskAssigned,
    /// `task:running`
    TaskRunning,
    /// `task:completed`
    TaskCompleted,
    /// `task:failed`
    TaskFailed,
    /// `task:retry`
    TaskRetryScheduled,
    /// `task:cancelled`
    TaskCancelled,
    /// `agent:registered`
    AgentRegistered,
    /// `agent:status`
    AgentStatusChanged,
    /// `agent:timeout`
    AgentHeartbeatTimeout,
    /// `agent:deregistered`
    AgentDeregistered,
    /// `memory:written`
    MemoryWritten,
    /// `memory:expired`
    MemoryExpired,
    /// `memory:deleted`
    MemoryDeleted,
    /// `deadlock:resolved`
    DeadlockResolved,
}

impl EventKind {
    /// Wire name, `<entity>:<action>`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectiveSubmitted => "objective:submitted",
            Self::ObjectiveCompleted => "objective:completed",
            Self::TaskReady => "task:ready",
            Self::TaskAssigned => "task:assigned",
            Self::TaskRunning => "task:running",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskRetryScheduled => "task:retry",
            Self::TaskCancelled => "task:cancelled",
            Self::AgentRegistered => "agent:registered",
            Self::AgentStatusChanged => "agent:status",
            Self::AgentHeartbeatTimeout => "agent:timeout",
            Self::AgentDeregistered => "agent:deregistered",
            Self::MemoryWritten => "memory:written",
            Self::MemoryExpired => "memory:expired",
            Self::MemoryDeleted => "memory:deleted",
            Self::DeadlockResolved => "deadlock:resolved",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of something that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// An objective was accepted
    ObjectiveSubmitted {
        /// Objective
        objective_id: ObjectiveId,
        /// Number of tasks
        task_count: usize,
    },
    /// Every task of an objective is terminal
    ObjectiveCompleted {
        /// Objective
        objective_id: ObjectiveId,
        /// Final status
        status: ObjectiveStatus,
    },
    /// All dependencies of a task completed
    TaskReady {
        /// Task
        task_id: TaskId,
    },
    /// A task was claimed by an agent
    TaskAssigned {
        /// Task
        task_id: TaskId,
        /// Assignee
        agent_id: AgentId,
        /// 1-based attempt number
        attempt: u32,
    },
    /// A task was dispatched to the backend
    TaskRunning {
        /// Task
        task_id: TaskId,
        /// Assignee
        agent_id: AgentId,
    },
    /// A task finished successfully
    TaskCompleted {
        /// Task
        task_id: TaskId,
        /// Assignee
        agent_id: AgentId,
        /// Execution time
        duration_ms: u64,
    },
    /// An attempt failed
    TaskFailed {
        /// Task
        task_id: TaskId,
        /// Assignee, if one was holding it
        agent_id: Option<AgentId>,
        /// Error message
        error: String,
        /// Attempts made so far
        attempt: u32,
        /// Whether the attempt budget is exhausted
        terminal: bool,
    },
    /// A failed task will become ready again after a delay
    TaskRetryScheduled {
        /// Task
        task_id: TaskId,
        /// Attempts made so far
        attempt: u32,
        /// Backoff
        delay_ms: u64,
    },
    /// A task was cancelled
    TaskCancelled {
        /// Task
        task_id: TaskId,
        /// Why
        reason: String,
    },
    /// A new agent joined
    AgentRegistered {
        /// Agent
        agent_id: AgentId,
        /// Agent kind
        kind: String,
    },
    /// An agent changed status
    AgentStatusChanged {
        /// Agent
        agent_id: AgentId,
        /// Previous status
        from: AgentStatus,
        /// New status
        to: AgentStatus,
    },
    /// An agent missed its heartbeat deadline
    AgentHeartbeatTimeout {
        /// Agent
        agent_id: AgentId,
        /// Tasks taken back from it
        reclaimed: Vec<TaskId>,
    },
    /// An agent left
    AgentDeregistered {
        /// Agent
        agent_id: AgentId,
    },
    /// A memory write was accepted
    MemoryWritten {
        /// Namespace
        namespace: String,
        /// Key
        key: String,
        /// New version
        version: u64,
    },
    /// A memory entry expired
    MemoryExpired {
        /// Namespace
        namespace: String,
        /// Key
        key: String,
    },
    /// A memory entry was deleted
    MemoryDeleted {
        /// Namespace
        namespace: String,
        /// Key
        key: String,
    },
    /// A stall was broken by force-cancelling a task
    DeadlockResolved {
        /// The cancelled task
        victim: TaskId,
        /// Every task that was stalled
        stalled: Vec<TaskId>,
    },
}

impl CoordinationEvent {
    /// The subscription key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ObjectiveSubmitted { .. } => EventKind::ObjectiveSubmitted,
            Self::ObjectiveCompleted { .. } => EventKind::ObjectiveCompleted,
            Self::TaskReady { .. } => EventKind::TaskReady,
            Self::TaskAssigned { .. } => EventKind::TaskAssigned,
            Self::TaskRunning { .. } => EventKind::TaskRunning,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskRetryScheduled { .. } => EventKind::TaskRetryScheduled,
            Self::TaskCancelled { .. } => EventKind::TaskCancelled,
            Self::AgentRegistered { .. } => EventKind::AgentRegistered,
            Self::AgentStatusChanged { .. } => EventKind::AgentStatusChanged,
            Self::AgentHeartbeatTimeout { .. } => EventKind::AgentHeartbeatTimeout,
            Self::AgentDeregistered { .. } => EventKind::AgentDeregistered,
            Self::MemoryWritten { .. } => EventKind::MemoryWritten,
            Self::MemoryExpired { .. } => EventKind::MemoryExpired,
            Self::MemoryDeleted { .. } => EventKind::MemoryDeleted,
            Self::DeadlockResolved { .. } => EventKind::DeadlockResolved,
        }
    }

    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskReady { task_id }
            | Self::TaskAssigned { task_id, .. }
            | Self::TaskRunning { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetryScheduled { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => Some(*task_id),
            Self::DeadlockResolved { victim, .. } => Some(*victim),
            _ => None,
        }
    }
}
