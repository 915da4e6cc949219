//! Objective model - a batch of related tasks submitted together.

use crate::id::{ObjectiveId, TaskId};
use crate::task::{TaskSpec, TaskStatus};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How coordinator responsibility is partitioned over agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyStrategy {
    /// One coordinator sees every agent
    #[default]
    Centralized,
    /// Agents and tasks sharded across peer coordinators
    Distributed,
    /// Teams with local coordinators reporting to a root
    Hierarchical,
    /// Every agent may pick up any task
    Mesh,
    /// Teams first, then shards, then the whole swarm
    Hybrid,
}

impl std::fmt::Display for TopologyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Centralized => "centralized",
            Self::Distributed => "distributed",
            Self::Hierarchical => "hierarchical",
            Self::Mesh => "mesh",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// An edge between two task names of the same objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Prerequisite task name
    pub from: String,
    /// Dependent task name
    pub to: String,
}

impl EdgeSpec {
    /// `to` waits for `from`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    /// What this objective is for
    #[serde(default)]
    pub description: String,
    /// Partitioning strategy
    #[serde(default)]
    pub strategy: TopologyStrategy,
    /// Tasks
    pub tasks: Vec<TaskSpec>,
    /// Dependency edges by task name
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl ObjectiveSpec {
    /// Create an empty objective spec.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            strategy: TopologyStrategy::default(),
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: TopologyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Add a task.
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    /// Add an edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(EdgeSpec::new(from, to));
        self
    }
}

/// Objective status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    /// Some task is not terminal yet
    Active,
    /// Every task completed
    Completed,
    /// Every task terminal, at least one failed or was cancelled
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl ObjectiveStatus {
    /// Whether the objective is finished.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// A submitted objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    /// Unique identifier
    pub id: ObjectiveId,
    /// Description
    pub description: String,
    /// Partitioning strategy
    pub strategy: TopologyStrategy,
    /// Member tasks, in submission order
    pub task_ids: Vec<TaskId>,
    /// Current status
    pub status: ObjectiveStatus,
    /// Submission time
    pub created_at: Time,
    /// When the objective became terminal
    pub completed_at: Option<Time>,
}

/// Progress summary of an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveProgress {
    /// Objective
    pub objective_id: ObjectiveId,
    /// Status
    pub status: ObjectiveStatus,
    /// Task count per status
    pub counts: BTreeMap<TaskStatus, usize>,
    /// Total tasks
    pub total: usize,
    /// Fraction of tasks that are terminal, in [0, 1]
    pub progress: f64,
}
