//! Task model - the unit of work the coordinator schedules.

use crate::id::{AgentId, ObjectiveId, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Task lifecycle status.
///
/// ```text
/// pending -> ready -> assigned -> running -> completed
///                                        \-> failed -> ready (retry)
/// any non-terminal state -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    Pending,
    /// All dependencies completed, waiting for an agent
    Ready,
    /// Claimed by an agent, not yet dispatched
    Assigned,
    /// Dispatched to the execution backend
    Running,
    /// Finished successfully
    Completed,
    /// Failed; terminal only once attempts are exhausted
    Failed,
    /// Cancelled
    Cancelled,
}

impl TaskStatus {
    /// Whether an agent slot is held for a task in this status.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Ready,
        Self::Assigned,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Caller-provided description of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name, unique within its objective; edges refer to it
    pub name: String,
    /// Task kind; matched against agent teams in hierarchical topologies
    #[serde(default)]
    pub kind: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Higher runs first and is cancelled last
    #[serde(default)]
    pub priority: i32,
    /// Capabilities an agent must expose
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Opaque input handed to the execution backend
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the configured attempt budget
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the configured timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    /// Create a spec with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            description: String::new(),
            priority: 0,
            required_capabilities: BTreeSet::new(),
            payload: serde_json::Value::Null,
            max_attempts: None,
            timeout_ms: None,
        }
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require a capability.
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A task tracked by the graph manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Owning objective, if submitted as part of one
    pub objective_id: Option<ObjectiveId>,
    /// Name from the `TaskSpec`
    pub name: String,
    /// Task kind
    pub kind: String,
    /// Description
    pub description: String,
    /// Priority (higher first)
    pub priority: i32,
    /// Capabilities an agent must expose
    pub required_capabilities: BTreeSet<String>,
    /// Backend input
    pub payload: serde_json::Value,
    /// Tasks that must complete first
    pub dependencies: BTreeSet<TaskId>,
    /// Current status
    pub status: TaskStatus,
    /// Agent holding the task while assigned or running
    pub assigned_agent_id: Option<AgentId>,
    /// Attempts made so far
    pub attempt: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Backend output on success
    pub result: Option<serde_json::Value>,
    /// Human-readable error with cause chain
    pub last_error: Option<String>,
    /// One message per failed attempt, oldest first
    pub error_history: Vec<String>,
    /// Bumped on every state change; compare-and-swap token
    pub version: u64,
    /// When a failed task becomes ready again
    pub retry_at: Option<Time>,
    /// Creation time
    pub created_at: Time,
    /// Last state change
    pub updated_at: Time,
    /// When the current attempt started running
    pub started_at: Option<Time>,
    /// When the task reached a terminal state
    pub finished_at: Option<Time>,
}

impl Task {
    /// Build a pending task from a spec.
    pub fn from_spec(
        spec: TaskSpec,
        objective_id: Option<ObjectiveId>,
        default_max_attempts: u32,
        default_timeout_ms: u64,
        now: Time,
    ) -> Self {
        Self {
            id: TaskId::new(),
            objective_id,
            name: spec.name,
            kind: spec.kind,
            description: spec.description,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            payload: spec.payload,
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            attempt: 0,
            max_attempts: spec.max_attempts.unwrap_or(default_max_attempts).max(1),
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            result: None,
            last_error: None,
            error_history: Vec::new(),
            version: 0,
            retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the task will never change state again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    /// Whether the task has not started executing yet.
    pub fn is_not_started(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
            || (self.status == TaskStatus::Failed && self.retry_at.is_some())
    }

    /// Move to `status`, bumping the version.
    pub fn transition(&mut self, status: TaskStatus, now: Time) {
        self.status = status;
        self.version += 1;
        self.updated_at = now;
    }

    /// Render the error history as a cause chain, newest first.
    pub fn error_chain(&self) -> Option<String> {
        if self.error_history.is_empty() {
            return None;
        }
        let chain: Vec<_> = self
            .error_history
            .iter()
            .enumerate()
            .rev()
            .map(|(i, e)| format!("attempt {}/{}: {}", i + 1, self.max_attempts, e))
            .collect();
        Some(chain.join(" <- "))
    }
}

/// A directed edge: `to` waits for `from` to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The prerequisite
    pub from: TaskId,
    /// The dependent
    pub to: TaskId,
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,
    /// Filter by objective
    pub objective_id: Option<ObjectiveId>,
    /// Filter by assigned agent
    pub agent_id: Option<AgentId>,
}

impl TaskFilter {
    /// Whether `task` passes this filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(objective_id) = self.objective_id {
            if task.objective_id != Some(objective_id) {
                return false;
            }
        }
        if let Some(agent_id) = self.agent_id {
            if task.assigned_agent_id != Some(agent_id) {
                return false;
            }
        }
        true
    }
}
