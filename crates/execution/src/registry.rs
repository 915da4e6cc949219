//! Agent Registry - the live set of agents and their mutable state.

use std::collections::{BTreeSet, HashMap};

use chrono::Duration as ChronoDuration;
use hivemind_core::{
    Agent, AgentCatalog, AgentDescriptor, AgentId, AgentStatus, CoordinationError,
    CoordinationEvent, EventBus, HeartbeatMetrics, Result, TaskId, Time,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Filter for querying agents.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    /// Accept only these statuses
    pub status: Option<Vec<AgentStatus>>,
    /// Agents must expose all of these
    pub capabilities: BTreeSet<String>,
    /// Match the agent kind
    pub kind: Option<String>,
    /// Match the agent team
    pub team: Option<String>,
}

impl AgentQuery {
    /// Accept only `status`.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status.get_or_insert_with(Vec::new).push(status);
        self
    }

    /// Require a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Match the agent kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn matches(&self, agent: &Agent) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&agent.status) {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &agent.kind != kind {
                return false;
            }
        }
        if let Some(team) = &self.team {
            if &agent.team != team {
                return false;
            }
        }
        agent.has_capabilities(&self.capabilities)
    }
}

/// An agent declared dead by the heartbeat sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleAgent {
    /// The agent
    pub agent_id: AgentId,
    /// Tasks it held when it went silent
    pub task_ids: Vec<TaskId>,
    /// Time since the last heartbeat
    pub silent_for_ms: i64,
}

/// Live agents, keyed by id.
pub struct AgentRegistry {
    agents: Mutex<HashMap<AgentId, Agent>>,
    catalog: AgentCatalog,
    bus: EventBus,
}

impl AgentRegistry {
    /// Create an empty registry using the built-in kind catalog.
    pub fn new(bus: EventBus) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            catalog: AgentCatalog::builtin(),
            bus,
        }
    }

    /// Use a different kind catalog.
    pub fn with_catalog(mut self, catalog: AgentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    fn status_event(agent: &Agent, from: AgentStatus) -> Option<CoordinationEvent> {
        (agent.status != from).then(|| CoordinationEvent::AgentStatusChanged {
            agent_id: agent.id,
            from,
            to: agent.status,
        })
    }

    /// Apply `f` to an agent and publish a status change if one happened.
    fn update<T>(&self, agent_id: AgentId, f: impl FnOnce(&mut Agent) -> Result<T>) -> Result<T> {
        let (value, event) = {
            let mut agents = self.agents.lock();
            let agent = agents
                .get_mut(&agent_id)
                .ok_or(CoordinationError::AgentNotFound(agent_id))?;
            let before = agent.status;
            let value = f(agent)?;
            (value, Self::status_event(agent, before))
        };
        if let Some(event) = event {
            debug!(agent_id = %agent_id, ?event, "Agent status changed");
            self.bus.publish(event);
        }
        Ok(value)
    }

    /// Register a new agent. Kind defaults from the catalog are merged in.
    pub fn register(&self, descriptor: AgentDescriptor, now: Time) -> Result<AgentId> {
        if descriptor.name.trim().is_empty() || descriptor.kind.trim().is_empty() {
            return Err(CoordinationError::InvalidSpec(
                "agent name and kind must not be empty".to_string(),
            ));
        }
        let capabilities = self
            .catalog
            .resolve_capabilities(&descriptor.kind, &descriptor.capabilities);
        let max = self
            .catalog
            .resolve_max_concurrent(&descriptor.kind, descriptor.max_concurrent_tasks);
        let agent = Agent::new(descriptor, capabilities, max, now);
        let (id, kind) = (agent.id, agent.kind.clone());

        info!(agent_id = %id, name = %agent.name, kind = %kind, max_concurrent = max, "Agent registered");
        self.agents.lock().insert(id, agent);
        self.bus
            .publish(CoordinationEvent::AgentRegistered { agent_id: id, kind });
        self.update(id, |agent| Ok(agent.activate()))?;
        Ok(id)
    }

    /// Record a liveness signal.
    ///
    /// Heartbeats older than the last one seen are ignored. An agent that
    /// had been declared dead comes back as idle.
    pub fn heartbeat(&self, agent_id: AgentId, metrics: HeartbeatMetrics) -> Result<()> {
        self.update(agent_id, |agent| {
            if metrics.sent_at < agent.last_heartbeat_at {
                debug!(agent_id = %agent_id, "Ignoring out-of-order heartbeat");
                return Ok(());
            }
            agent.last_heartbeat_at = metrics.sent_at;
            if let Some(health) = metrics.health {
                agent.health = health.clamp(0.0, 1.0);
            }
            if agent.status == AgentStatus::Error {
                info!(agent_id = %agent_id, "Agent recovered");
                agent.status = AgentStatus::Idle;
                agent.recompute_workload();
            }
            Ok(())
        })
    }

    /// Remove an agent, returning its final state.
    pub fn deregister(&self, agent_id: AgentId) -> Result<Agent> {
        let agent = self
            .agents
            .lock()
            .remove(&agent_id)
            .ok_or(CoordinationError::AgentNotFound(agent_id))?;
        info!(agent_id = %agent_id, in_flight = agent.current_task_ids.len(), "Agent deregistered");
        self.bus
            .publish(CoordinationEvent::AgentDeregistered { agent_id });
        Ok(agent)
    }

    /// Stop offering tasks to an idle or busy agent.
    pub fn pause(&self, agent_id: AgentId) -> Result<()> {
        self.update(agent_id, |agent| {
            if !agent.status.is_selectable() {
                return Err(CoordinationError::InvalidSpec(format!(
                    "cannot pause agent {agent_id} while {}",
                    agent.status
                )));
            }
            agent.status = AgentStatus::Paused;
            Ok(())
        })
    }

    /// Make a paused agent selectable again.
    pub fn resume(&self, agent_id: AgentId) -> Result<()> {
        self.update(agent_id, |agent| {
            if agent.status != AgentStatus::Paused {
                return Err(CoordinationError::InvalidSpec(format!(
                    "cannot resume agent {agent_id} while {}",
                    agent.status
                )));
            }
            agent.status = AgentStatus::Idle;
            agent.recompute_workload();
            Ok(())
        })
    }

    /// A copy of the agent.
    pub fn get(&self, agent_id: AgentId) -> Option<Agent> {
        self.agents.lock().get(&agent_id).cloned()
    }

    /// Agents matching `query`, ordered by id.
    pub fn query(&self, query: &AgentQuery) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .lock()
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    /// Every agent, ordered by id.
    pub fn agents(&self) -> Vec<Agent> {
        self.query(&AgentQuery::default())
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declare agents silent for longer than `timeout` dead.
    ///
    /// Each is marked `error` and stripped of its in-flight tasks, which
    /// the caller must hand back to the graph.
    pub fn sweep_stale(&self, now: Time, timeout: ChronoDuration) -> Vec<StaleAgent> {
        let mut stale = Vec::new();
        let mut events = Vec::new();
        {
            let mut agents = self.agents.lock();
            for agent in agents.values_mut() {
                if matches!(
                    agent.status,
                    AgentStatus::Error | AgentStatus::Terminating | AgentStatus::Terminated
                ) {
                    continue;
                }
                let silent_for = now - agent.last_heartbeat_at;
                if silent_for <= timeout {
                    continue;
                }
                let before = agent.status;
                let task_ids: Vec<TaskId> = std::mem::take(&mut agent.current_task_ids)
                    .into_iter()
                    .collect();
                agent.status = AgentStatus::Error;
                agent.recompute_workload();
                warn!(
                    agent_id = %agent.id,
                    silent_for_ms = silent_for.num_milliseconds(),
                    in_flight = task_ids.len(),
                    "Agent missed heartbeats"
                );
                events.extend(Self::status_event(agent, before));
                stale.push(StaleAgent {
                    agent_id: agent.id,
                    task_ids,
                    silent_for_ms: silent_for.num_milliseconds(),
                });
            }
        }
        for event in events {
            self.bus.publish(event);
        }
        stale.sort_by_key(|s| s.agent_id);
        stale
    }

    /// Reserve a slot on the agent for `task_id`.
    ///
    /// Eligibility is re-checked under the lock; an agent that changed
    /// since it was scored yields [`CoordinationError::AssignmentConflict`].
    pub fn reserve_slot(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        min_health: f64,
        max_workload: f64,
    ) -> Result<Agent> {
        self.update(agent_id, |agent| {
            let eligible = agent.status.is_selectable()
                && agent.health >= min_health
                && agent.workload < max_workload
                && agent.has_capacity();
            if !eligible {
                return Err(CoordinationError::AssignmentConflict { task_id });
            }
            agent.current_task_ids.insert(task_id);
            agent.recompute_workload();
            Ok(agent.clone())
        })
    }

    /// Give back a slot without touching the counters.
    pub fn release_slot(&self, agent_id: AgentId, task_id: TaskId) -> bool {
        self.update(agent_id, |agent| {
            let held = agent.current_task_ids.remove(&task_id);
            agent.recompute_workload();
            Ok(held)
        })
        .unwrap_or(false)
    }

    /// Release the slot and count a success.
    pub fn record_success(&self, agent_id: AgentId, task_id: TaskId, duration_ms: u64) -> bool {
        self.update(agent_id, |agent| {
            if !agent.current_task_ids.remove(&task_id) {
                return Ok(false);
            }
            agent.record_execution_time(duration_ms as f64);
            agent.tasks_completed += 1;
            agent.recompute_workload();
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Release the slot, count a failure and apply a health penalty.
    pub fn record_failure(&self, agent_id: AgentId, task_id: TaskId, penalty: f64) -> bool {
        self.update(agent_id, |agent| {
            if !agent.current_task_ids.remove(&task_id) {
                return Ok(false);
            }
            agent.tasks_failed += 1;
            agent.health = (agent.health - penalty).clamp(0.0, 1.0);
            agent.recompute_workload();
            debug!(agent_id = %agent_id, health = agent.health, "Agent penalized");
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Replace the registry with persisted agents.
    ///
    /// In-flight slots are dropped since their executions died with the
    /// previous process; heartbeat clocks restart at `now`.
    pub fn restore(&self, agents: Vec<Agent>, now: Time) {
        let mut restored = HashMap::with_capacity(agents.len());
        for mut agent in agents {
            agent.current_task_ids.clear();
            agent.last_heartbeat_at = now;
            agent.recompute_workload();
            restored.insert(agent.id, agent);
        }
        info!(agents = restored.len(), "Agent registry restored");
        *self.agents.lock() = restored;
    }
}
