//! Error taxonomy for the coordination engine.

use crate::id::{AgentId, ObjectiveId, TaskId};
use crate::task::TaskStatus;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors raised by the coordination engine.
///
/// Errors tied to a single task or agent are absorbed by the coordinator
/// and turned into state transitions; only spec and lookup errors reach
/// callers of the public API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinationError {
    /// Inserting an edge would close a cycle
    #[error("dependency cycle: {}", format_path(.path))]
    DependencyCycle {
        /// The cycle, starting and ending at the same task
        path: Vec<TaskId>,
    },

    /// No agent passed the selection filters
    #[error("no eligible agent for task {task_id}")]
    NoCandidate {
        /// The unassignable task
        task_id: TaskId,
    },

    /// Agent stopped heartbeating
    #[error("agent {agent_id} missed heartbeats for {silent_for_ms}ms")]
    AgentHeartbeatTimeout {
        /// The silent agent
        agent_id: AgentId,
        /// Time since the last heartbeat
        silent_for_ms: i64,
    },

    /// Backend did not answer within the timeout
    #[error("task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task
        task_id: TaskId,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Backend reported or raised a failure
    #[error("task {task_id} failed: {message}")]
    TaskExecution {
        /// The task
        task_id: TaskId,
        /// Backend message
        message: String,
    },

    /// Another scheduling pass already claimed the task
    #[error("task {task_id} was claimed concurrently")]
    AssignmentConflict {
        /// The contested task
        task_id: TaskId,
    },

    /// Access level check failed
    #[error("access denied to {namespace}/{key}")]
    MemoryAccessDenied {
        /// Key
        key: String,
        /// Namespace
        namespace: String,
    },

    /// A custom merge function failed
    #[error("merge failed: {0}")]
    MemoryConflictResolution(String),

    /// Malformed task or objective spec
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Task lookup failed
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Agent lookup failed
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Objective lookup failed
    #[error("objective not found: {0}")]
    ObjectiveNotFound(ObjectiveId),

    /// State machine rejected a transition
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The task
        task_id: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
