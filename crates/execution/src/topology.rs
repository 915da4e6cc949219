//! Topology partitioning.
//!
//! A topology decides which agents are candidates for a task. The task
//! state machine is the same under every strategy; only the pool changes.

use hivemind_core::{Agent, Task, TopologyStrategy};

/// Splits the agent pool according to a [`TopologyStrategy`].
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    partitions: u64,
}

impl Topology {
    /// Create a topology with `partitions` shards for distributed pools.
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1) as u64,
        }
    }

    /// Shard a task belongs to.
    pub fn task_shard(&self, task: &Task) -> u64 {
        task.id.fingerprint() % self.partitions
    }

    /// Shard an agent belongs to.
    pub fn agent_shard(&self, agent: &Agent) -> u64 {
        agent.id.fingerprint() % self.partitions
    }

    /// Candidate agents for `task`.
    ///
    /// Narrow pools that hold no selectable agent fall back to the next
    /// wider pool, ending at every agent.
    pub fn candidates<'a>(
        &self,
        strategy: TopologyStrategy,
        task: &Task,
        agents: &'a [Agent],
    ) -> Vec<&'a Agent> {
        let team = || self.team(task, agents);
        let shard = || self.shard(task, agents);
        let pool = match strategy {
            TopologyStrategy::Centralized | TopologyStrategy::Mesh => None,
            TopologyStrategy::Hierarchical => non_empty(team()),
            TopologyStrategy::Distributed => non_empty(shard()),
            TopologyStrategy::Hybrid => non_empty(team()).or_else(|| non_empty(shard())),
        };
        pool.unwrap_or_else(|| agents.iter().collect())
    }

    fn team<'a>(&self, task: &Task, agents: &'a [Agent]) -> Vec<&'a Agent> {
        if task.kind.is_empty() {
            return Vec::new();
        }
        agents.iter().filter(|a| a.team == task.kind).collect()
    }

    fn shard<'a>(&self, task: &Task, agents: &'a [Agent]) -> Vec<&'a Agent> {
        let shard = self.task_shard(task);
        agents
            .iter()
            .filter(|a| self.agent_shard(a) == shard)
            .collect()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(4)
    }
}

fn non_empty(pool: Vec<&Agent>) -> Option<Vec<&Agent>> {
    pool.iter()
        .any(|a| a.status.is_selectable())
        .then_some(pool)
}
