//! Agent model - the workers that execute tasks.

use crate::id::{AgentId, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created, registration not finished
    Initializing,
    /// Ready for work, nothing in flight
    Idle,
    /// At least one task in flight
    Busy,
    /// Temporarily withdrawn from selection
    Paused,
    /// Missed heartbeats or crashed
    Error,
    /// Shutting down, finishing nothing new
    Terminating,
    /// Gone
    Terminated,
}

impl AgentStatus {
    /// Whether an agent in this status may receive new work.
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// What a caller supplies to register an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Human-readable name
    pub name: String,
    /// Agent kind, looked up in the [`crate::AgentCatalog`]
    pub kind: String,
    /// Capabilities on top of the kind defaults
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Overrides the kind's default concurrency
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
    /// Team used for `team`-level memory access and hierarchical topology.
    /// Defaults to the agent kind.
    #[serde(default)]
    pub team: Option<String>,
}

impl AgentDescriptor {
    /// Create a descriptor for the given kind.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Add a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Set max concurrent tasks.
    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    /// Set the team.
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }
}

/// Health report sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// Self-reported health in [0, 1]; `None` keeps the current value
    pub health: Option<f64>,
    /// When the agent produced this heartbeat
    pub sent_at: Time,
}

impl HeartbeatMetrics {
    /// A heartbeat carrying only liveness.
    pub fn alive(sent_at: Time) -> Self {
        Self { health: None, sent_at }
    }

    /// A heartbeat that also reports health.
    pub fn with_health(sent_at: Time, health: f64) -> Self {
        Self {
            health: Some(health),
            sent_at,
        }
    }
}

/// A live agent tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier
    pub id: AgentId,
    /// Human-readable name
    pub name: String,
    /// Agent kind
    pub kind: String,
    /// Team (defaults to kind)
    pub team: String,
    /// Everything this agent can do
    pub capabilities: BTreeSet<String>,
    /// Current status
    pub status: AgentStatus,
    /// Health in [0, 1]
    pub health: f64,
    /// `current_task_ids.len() / max_concurrent_tasks`
    pub workload: f64,
    /// Tasks assigned or running on this agent
    pub current_task_ids: BTreeSet<TaskId>,
    /// Nominal capacity
    pub max_concurrent_tasks: u32,
    /// Completed task count
    pub tasks_completed: u64,
    /// Failed task count
    pub tasks_failed: u64,
    /// Exponential moving average of execution time
    pub average_execution_time_ms: f64,
    /// Last accepted heartbeat
    pub last_heartbeat_at: Time,
    /// Registration time
    pub registered_at: Time,
}

impl Agent {
    /// Build an agent from a descriptor and resolved capabilities.
    pub fn new(
        descriptor: AgentDescriptor,
        capabilities: BTreeSet<String>,
        max_concurrent_tasks: u32,
        now: Time,
    ) -> Self {
        let team = descriptor
            .team
            .clone()
            .unwrap_or_else(|| descriptor.kind.clone());
        Self {
            id: AgentId::new(),
            name: descriptor.name,
            kind: descriptor.kind,
            team,
            capabilities,
            status: AgentStatus::Initializing,
            health: 1.0,
            workload: 0.0,
            current_task_ids: BTreeSet::new(),
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            tasks_completed: 0,
            tasks_failed: 0,
            average_execution_time_ms: 0.0,
            last_heartbeat_at: now,
            registered_at: now,
        }
    }

    /// Finish registration: an initializing agent becomes idle.
    ///
    /// Returns false if the agent was already past initialization.
    pub fn activate(&mut self) -> bool {
        if self.status != AgentStatus::Initializing {
            return false;
        }
        self.status = AgentStatus::Idle;
        self.recompute_workload();
        true
    }

    /// `tasks_completed / max(1, tasks_completed + tasks_failed)`.
    pub fn success_rate(&self) -> f64 {
        let total = (self.tasks_completed + self.tasks_failed).max(1);
        self.tasks_completed as f64 / total as f64
    }

    /// Whether the agent has a free nominal slot.
    pub fn has_capacity(&self) -> bool {
        (self.current_task_ids.len() as u32) < self.max_concurrent_tasks
    }

    /// Whether the agent exposes every required capability.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Fraction of required capabilities this agent has; 1.0 when nothing is required.
    pub fn capability_match_ratio(&self, required: &BTreeSet<String>) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = required.intersection(&self.capabilities).count();
        matched as f64 / required.len() as f64
    }

    /// Restore the workload invariant and derive idle/busy from it.
    pub fn recompute_workload(&mut self) {
        self.workload = self.current_task_ids.len() as f64 / self.max_concurrent_tasks as f64;
        if self.status.is_selectable() {
            self.status = if self.current_task_ids.is_empty() {
                AgentStatus::Idle
            } else {
                AgentStatus::Busy
            };
        }
    }

    /// Fold an execution time sample into the moving average.
    pub fn record_execution_time(&mut self, sample_ms: f64) {
        if self.tasks_completed == 0 && self.average_execution_time_ms == 0.0 {
            self.average_execution_time_ms = sample_ms;
        } else {
            self.average_execution_time_ms = self.average_execution_time_ms * 0.8 + sample_ms * 0.2;
        }
    }
}
