//! Agent selection - filtering and scoring candidates for a ready task.
//!
//! Filters apply in order: status must be idle or busy, health must reach
//! the floor, every required capability must be present, and workload must
//! stay below the saturation threshold. Survivors are scored out of 100:
//!
//! ```text
//! score = health*40 + successRate*30 + (1-workload)*20 + capabilityMatchRatio*10
//! ```
//!
//! Ties go to the lowest workload, then the lowest agent id.

use std::cmp::Ordering;

use hivemind_core::{Agent, AgentId, CoordinationError, CoordinatorConfig, Result, Task};

/// A candidate that survived filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAgent {
    /// Candidate
    pub agent_id: AgentId,
    /// Fitness out of 100
    pub score: f64,
    /// Workload at scoring time
    pub workload: f64,
}

/// Scores candidate agents for a task.
#[derive(Debug, Clone, Copy)]
pub struct AgentSelector {
    min_health: f64,
    max_workload: f64,
}

impl AgentSelector {
    /// Create a selector with explicit thresholds.
    pub fn new(min_health: f64, max_workload: f64) -> Self {
        Self {
            min_health,
            max_workload,
        }
    }

    /// Thresholds from configuration.
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.min_health, config.max_workload)
    }

    /// Minimum health a candidate needs.
    pub fn min_health(&self) -> f64 {
        self.min_health
    }

    /// Workload at which a candidate counts as saturated.
    pub fn max_workload(&self) -> f64 {
        self.max_workload
    }

    /// Whether `agent` passes every filter for `task`.
    pub fn is_eligible(&self, task: &Task, agent: &Agent) -> bool {
        agent.status.is_selectable()
            && agent.health >= self.min_health
            && agent.has_capabilities(&task.required_capabilities)
            && agent.workload < self.max_workload
            && agent.has_capacity()
    }

    /// Fitness of `agent` for `task`, ignoring the filters.
    pub fn score(task: &Task, agent: &Agent) -> f64 {
        agent.health * 40.0
            + agent.success_rate() * 30.0
            + (1.0 - agent.workload) * 20.0
            + agent.capability_match_ratio(&task.required_capabilities) * 10.0
    }

    /// Eligible candidates, best first.
    pub fn rank<'a>(&self, task: &Task, candidates: impl IntoIterator<Item = &'a Agent>) -> Vec<ScoredAgent> {
        let mut ranked: Vec<ScoredAgent> = candidates
            .into_iter()
            .filter(|agent| self.is_eligible(task, agent))
            .map(|agent| ScoredAgent {
                agent_id: agent.id,
                score: Self::score(task, agent),
                workload: agent.workload,
            })
            .collect();
        ranked.sort_by(compare);
        ranked
    }

    /// The best candidate for `task`.
    pub fn select<'a>(&self, task: &Task, candidates: impl IntoIterator<Item = &'a Agent>) -> Result<AgentId> {
        self.rank(task, candidates)
            .first()
            .map(|best| best.agent_id)
            .ok_or(CoordinationError::NoCandidate { task_id: task.id })
    }
}

impl Default for AgentSelector {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

fn compare(a: &ScoredAgent, b: &ScoredAgent) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.workload.total_cmp(&b.workload))
        .then(a.agent_id.cmp(&b.agent_id))
}
