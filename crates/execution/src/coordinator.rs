//! The coordinator - the top-level control loop.
//!
//! Each scheduling tick pulls the ready frontier from the [`TaskGraph`],
//! narrows the agent pool through the objective's [`Topology`], asks the
//! [`AgentSelector`] for the best agent and claims the task. Claims are two
//! step: a slot is reserved on the agent, then the task is moved to
//! `assigned` with a compare-and-swap on its version. A tick that loses
//! either step backs off, so concurrent ticks never double-assign.
//!
//! Claimed tasks are dispatched to the [`ExecutionBackend`] on their own
//! tokio task. Results flow back through the graph (which rejects results
//! for tasks that were cancelled or reclaimed meanwhile) and the registry.
//!
//! [`Coordinator::run`] drives ticks, heartbeat sweeps, memory sweeps,
//! deadlock scans and optional snapshots on fixed timers, and also ticks
//! whenever a task becomes ready or an agent changes state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hivemind_core::{
    Agent, AgentCatalog, AgentDescriptor, AgentId, CoordinationError, CoordinationEvent,
    CoordinatorConfig, EventBus, EventHandler, EventKind, EventStream, HeartbeatMetrics,
    ObjectiveId, ObjectiveProgress, ObjectiveSpec, ObjectiveStatus, Result, Subscription, Task,
    TaskFilter, TaskId, TaskSpec, Time,
};
use hivemind_memory::{MemoryStore, MergePolicy};
use hivemind_storage::{Snapshot, SnapshotStore};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::AbortHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, FailureSeverity};
use crate::deadlock::{DeadlockDetector, DeadlockReport};
use crate::graph::{CancelOutcome, TaskGraph};
use crate::registry::{AgentQuery, AgentRegistry};
use crate::selector::AgentSelector;
use crate::topology::Topology;

/// What one scheduling tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Tasks claimed this tick and their agents
    pub assigned: Vec<(TaskId, AgentId)>,
    /// Ready tasks with no eligible agent
    pub unassignable: Vec<TaskId>,
    /// Claims lost to a concurrent tick or a state change
    pub conflicts: usize,
}

/// The coordination engine.
pub struct Coordinator {
    config: CoordinatorConfig,
    bus: EventBus,
    graph: TaskGraph,
    registry: AgentRegistry,
    selector: AgentSelector,
    topology: Topology,
    detector: DeadlockDetector,
    memory: Arc<MemoryStore>,
    backend: Arc<dyn ExecutionBackend>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    /// Live dispatches, keyed by task, tagged with the claim version
    executions: Mutex<HashMap<TaskId, (u64, AbortHandle)>>,
    wake: Arc<Notify>,
}

impl Coordinator {
    /// Create a coordinator dispatching to `backend`.
    pub fn new(config: CoordinatorConfig, backend: Arc<dyn ExecutionBackend>) -> Result<Self> {
        config.validate().map_err(CoordinationError::InvalidSpec)?;

        let bus = EventBus::new(config.event_buffer);
        let wake = Arc::new(Notify::new());
        let waker = Arc::clone(&wake);
        // Dropping the subscription keeps the handler registered.
        let _ = bus.subscribe_all(move |event: &CoordinationEvent| -> anyhow::Result<()> {
            if matches!(
                event.kind(),
                EventKind::TaskReady | EventKind::AgentRegistered | EventKind::AgentStatusChanged
            ) {
                waker.notify_one();
            }
            Ok(())
        });

        Ok(Self {
            graph: TaskGraph::new(bus.clone())
                .with_defaults(config.default_max_attempts, config.default_task_timeout_ms),
            registry: AgentRegistry::new(bus.clone()),
            selector: AgentSelector::from_config(&config),
            topology: Topology::new(config.topology_partitions),
            detector: DeadlockDetector::new(Duration::from_millis(config.deadlock_grace_ms)),
            memory: Arc::new(MemoryStore::new(config.memory_partitions, bus.clone())),
            backend,
            snapshots: None,
            executions: Mutex::new(HashMap::new()),
            wake,
            bus,
            config,
        })
    }

    /// Persist snapshots through `store`.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Reconcile concurrent memory writes with `policy`.
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.memory = Arc::new(MemoryStore::with_policy(
            self.config.memory_partitions,
            self.bus.clone(),
            policy,
        ));
        self
    }

    /// Resolve agent kinds against `catalog`.
    pub fn with_catalog(mut self, catalog: AgentCatalog) -> Self {
        self.registry = AgentRegistry::new(self.bus.clone()).with_catalog(catalog);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The task graph.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// The agent registry.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Shared memory.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // === Public API ===

    /// Submit an objective: named tasks plus edges between them.
    pub fn submit_objective(&self, spec: ObjectiveSpec) -> Result<ObjectiveId> {
        self.graph.submit_objective(spec, Utc::now())
    }

    /// Add a standalone task.
    pub fn add_task(&self, spec: TaskSpec, dependencies: &[TaskId]) -> Result<TaskId> {
        self.graph.add_task(spec, dependencies, Utc::now())
    }

    /// Make `to` wait for `from`.
    pub fn add_dependency(&self, from: TaskId, to: TaskId) -> Result<()> {
        self.graph.add_dependency(from, to, Utc::now())
    }

    /// Register an agent.
    pub fn register_agent(&self, descriptor: AgentDescriptor) -> Result<AgentId> {
        self.registry.register(descriptor, Utc::now())
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, agent_id: AgentId, metrics: HeartbeatMetrics) -> Result<()> {
        self.registry.heartbeat(agent_id, metrics)
    }

    /// Remove an agent. Its in-flight tasks go back to the ready frontier.
    pub fn deregister_agent(&self, agent_id: AgentId) -> Result<Vec<TaskId>> {
        let agent = self.registry.deregister(agent_id)?;
        let now = Utc::now();
        let reclaimed: Vec<TaskId> = agent
            .current_task_ids
            .iter()
            .copied()
            .filter(|&task_id| self.graph.reclaim(task_id, agent_id, now))
            .collect();
        for &task_id in &reclaimed {
            self.abort_execution(task_id);
        }
        Ok(reclaimed)
    }

    /// Stop offering tasks to an agent.
    pub fn pause_agent(&self, agent_id: AgentId) -> Result<()> {
        self.registry.pause(agent_id)
    }

    /// Offer tasks to a paused agent again.
    pub fn resume_agent(&self, agent_id: AgentId) -> Result<()> {
        self.registry.resume(agent_id)
    }

    /// Current state of a task.
    pub fn get_task_status(&self, task_id: TaskId) -> Result<Task> {
        self.graph
            .get(task_id)
            .ok_or(CoordinationError::TaskNotFound(task_id))
    }

    /// Current state of an agent.
    pub fn get_agent_status(&self, agent_id: AgentId) -> Result<Agent> {
        self.registry
            .get(agent_id)
            .ok_or(CoordinationError::AgentNotFound(agent_id))
    }

    /// The ready frontier, highest priority first.
    pub fn list_ready_tasks(&self) -> Vec<Task> {
        self.graph.ready_tasks()
    }

    /// Tasks passing `filter`.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.graph.list(filter)
    }

    /// Agents matching `query`.
    pub fn query_agents(&self, query: &AgentQuery) -> Vec<Agent> {
        self.registry.query(query)
    }

    /// Progress of an objective.
    pub fn objective_status(&self, objective_id: ObjectiveId) -> Result<ObjectiveProgress> {
        self.graph.objective_progress(objective_id)
    }

    /// Cancel a task and its not-yet-started dependents.
    ///
    /// Cancelling a running task is advisory: the slot is released at once
    /// and the backend gets a best-effort abort.
    pub fn cancel_task(&self, task_id: TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let outcome = self.graph.cancel(task_id, reason, Utc::now())?;
        Ok(self.release(outcome))
    }

    /// Cancel every unfinished task of an objective.
    pub fn cancel_objective(&self, objective_id: ObjectiveId) -> Result<Vec<TaskId>> {
        let outcome = self.graph.cancel_objective(objective_id, Utc::now())?;
        Ok(self.release(outcome))
    }

    /// Drop terminal tasks that finished at or before `older_than`.
    pub fn purge_terminal(&self, older_than: Time) -> Vec<TaskId> {
        self.graph.purge_terminal(older_than)
    }

    /// Observe one kind of event.
    pub fn subscribe<H: EventHandler>(&self, kind: EventKind, handler: H) -> Subscription {
        self.bus.subscribe(kind, handler)
    }

    /// Async stream of every event.
    pub fn events(&self) -> EventStream {
        self.bus.stream()
    }

    /// Wait until the objective reaches a terminal status.
    pub async fn wait_for_objective(&self, objective_id: ObjectiveId) -> Result<ObjectiveStatus> {
        let mut stream = self.bus.stream();
        loop {
            let objective = self
                .graph
                .objective(objective_id)
                .ok_or(CoordinationError::ObjectiveNotFound(objective_id))?;
            if objective.status.is_terminal() {
                return Ok(objective.status);
            }
            if stream.recv().await.is_none() {
                return Ok(objective.status);
            }
        }
    }

    // === Scheduling ===

    /// Run one scheduling pass over the ready frontier.
    pub fn tick(self: &Arc<Self>) -> TickReport {
        let now = Utc::now();
        let mut report = TickReport::default();
        let ready = self.graph.ready_tasks();
        if ready.is_empty() {
            return report;
        }

        let mut agents = self.registry.agents();
        for task in ready {
            let strategy = self.graph.strategy_for(&task);
            let pool = self.topology.candidates(strategy, &task, &agents);
            let agent_id = match self.selector.select(&task, pool) {
                Ok(agent_id) => agent_id,
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Task left ready");
                    self.detector.observe_unassignable(task.id, now);
                    report.unassignable.push(task.id);
                    continue;
                }
            };

            match self.claim(&task, agent_id, now) {
                Ok((claimed, agent)) => {
                    self.detector.clear(claimed.id);
                    report.assigned.push((claimed.id, agent.id));
                    self.dispatch(claimed, agent);
                }
                Err(e) => {
                    debug!(task_id = %task.id, agent_id = %agent_id, error = %e, "Claim lost");
                    report.conflicts += 1;
                }
            }
            agents = self.registry.agents();
        }

        if self.detector.has_overdue(now) {
            self.resolve_deadlocks(now);
        }
        report
    }

    /// Reserve the agent slot, then compare-and-swap the task.
    fn claim(&self, task: &Task, agent_id: AgentId, now: Time) -> Result<(Task, Agent)> {
        let agent = self.registry.reserve_slot(
            agent_id,
            task.id,
            self.selector.min_health(),
            self.selector.max_workload(),
        )?;
        match self.graph.try_assign(task.id, task.version, agent_id, now) {
            Ok(claimed) => Ok((claimed, agent)),
            Err(e) => {
                self.registry.release_slot(agent_id, task.id);
                Err(e)
            }
        }
    }

    fn dispatch(self: &Arc<Self>, task: Task, agent: Agent) {
        let task_id = task.id;
        let ticket = task.version;
        let this = Arc::clone(self);
        // Hold the map while spawning so the execution cannot finish and
        // deregister before it is registered.
        let mut executions = self.executions.lock();
        let handle = tokio::spawn(async move { this.execute(task, agent, ticket).await });
        executions.insert(task_id, (ticket, handle.abort_handle()));
    }

    async fn execute(self: Arc<Self>, task: Task, agent: Agent, ticket: u64) {
        let task_id = task.id;
        let task = match self.graph.mark_running(task_id, agent.id, Utc::now()) {
            Ok(task) => task,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Dispatch dropped before start");
                self.forget_execution(task_id, ticket);
                return;
            }
        };

        let started = Instant::now();
        let timeout = Duration::from_millis(task.timeout_ms);
        let result = tokio::time::timeout(timeout, self.backend.execute(&task, &agent)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.forget_execution(task_id, ticket);

        match result {
            Ok(Ok(outcome)) if outcome.success => {
                self.on_success(&task, &agent, outcome.output, duration_ms);
            }
            Ok(Ok(outcome)) => {
                let error = CoordinationError::TaskExecution {
                    task_id,
                    message: outcome.error_message(),
                };
                self.on_failure(&task, &agent, error, outcome.severity.unwrap_or_default());
            }
            Ok(Err(e)) => {
                error!(task_id = %task_id, agent_id = %agent.id, error = %format!("{e:#}"), "Execution backend crashed");
                let error = CoordinationError::TaskExecution {
                    task_id,
                    message: format!("{e:#}"),
                };
                self.on_failure(&task, &agent, error, FailureSeverity::Critical);
            }
            Err(_) => {
                self.backend.abort(task_id).await;
                let error = CoordinationError::TaskTimeout {
                    task_id,
                    timeout_ms: task.timeout_ms,
                };
                self.on_failure(&task, &agent, error, FailureSeverity::Critical);
            }
        }
        self.wake.notify_one();
    }

    fn on_success(&self, task: &Task, agent: &Agent, output: serde_json::Value, duration_ms: u64) {
        match self
            .graph
            .complete(task.id, agent.id, output, duration_ms, Utc::now())
        {
            Ok(_) => {
                self.registry.record_success(agent.id, task.id, duration_ms);
            }
            Err(e) => debug!(task_id = %task.id, error = %e, "Ignoring late result"),
        }
    }

    fn on_failure(
        self: &Arc<Self>,
        task: &Task,
        agent: &Agent,
        error: CoordinationError,
        severity: FailureSeverity,
    ) {
        let config = &self.config;
        let outcome = self.graph.fail(
            task.id,
            Some(agent.id),
            attempt_message(&error),
            Utc::now(),
            |attempt| config.retry_delay(attempt),
        );
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Ignoring late failure");
                return;
            }
        };
        self.registry
            .record_failure(agent.id, task.id, severity.penalty());

        match outcome.retry_delay {
            Some(delay) => {
                warn!(
                    task_id = %task.id,
                    attempt = outcome.attempt,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying"
                );
                self.schedule_retry(task.id, delay);
            }
            None => {
                let chain = self
                    .graph
                    .get(task.id)
                    .and_then(|t| t.last_error)
                    .unwrap_or_default();
                error!(
                    task_id = %task.id,
                    cancelled = outcome.cancelled.len(),
                    error = %chain,
                    "Task failed terminally"
                );
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, task_id: TaskId, delay: Duration) {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = this.upgrade() {
                this.graph.release_retry(task_id, Utc::now());
            }
        });
    }

    fn forget_execution(&self, task_id: TaskId, ticket: u64) {
        let mut executions = self.executions.lock();
        if executions.get(&task_id).is_some_and(|(t, _)| *t == ticket) {
            executions.remove(&task_id);
        }
    }

    /// Stop a dispatch and tell the backend, best effort.
    fn abort_execution(&self, task_id: TaskId) {
        if let Some((_, handle)) = self.executions.lock().remove(&task_id) {
            handle.abort();
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let backend = Arc::clone(&self.backend);
            runtime.spawn(async move { backend.abort(task_id).await });
        }
    }

    fn release(&self, outcome: CancelOutcome) -> Vec<TaskId> {
        for &(task_id, agent_id) in &outcome.released {
            self.registry.release_slot(agent_id, task_id);
            self.abort_execution(task_id);
        }
        for task_id in &outcome.cancelled {
            self.detector.clear(*task_id);
        }
        outcome.cancelled
    }

    // === Sweeps ===

    /// Declare silent agents dead and reclaim their tasks.
    pub fn sweep_heartbeats(&self, now: Time) -> Vec<AgentId> {
        let timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let stale = self.registry.sweep_stale(now, timeout);
        for agent in &stale {
            let reclaimed: Vec<TaskId> = agent
                .task_ids
                .iter()
                .copied()
                .filter(|&task_id| self.graph.reclaim(task_id, agent.agent_id, now))
                .collect();
            for &task_id in &reclaimed {
                self.abort_execution(task_id);
            }
            let error = CoordinationError::AgentHeartbeatTimeout {
                agent_id: agent.agent_id,
                silent_for_ms: agent.silent_for_ms,
            };
            warn!(error = %error, reclaimed = reclaimed.len(), "Reclaiming tasks from silent agent");
            self.bus.publish(CoordinationEvent::AgentHeartbeatTimeout {
                agent_id: agent.agent_id,
                reclaimed,
            });
        }
        stale.into_iter().map(|s| s.agent_id).collect()
    }

    /// Break a deadlock by force-cancelling the lowest-priority stalled task.
    ///
    /// Stalled tasks that some agent could take right now are dropped from
    /// consideration first.
    pub fn resolve_deadlocks(&self, now: Time) -> Option<DeadlockReport> {
        let agents = self.registry.agents();
        let schedulable = |task: &Task| {
            let pool = self
                .topology
                .candidates(self.graph.strategy_for(task), task, &agents);
            self.selector.select(task, pool).is_ok()
        };
        let report = self.detector.scan(&self.graph, now, schedulable)?;
        warn!(
            victim = %report.victim,
            stalled = ?report.stalled,
            "Deadlock detected, force-cancelling lowest-priority task"
        );
        match self.graph.cancel(report.victim, "deadlock victim", now) {
            Ok(outcome) => {
                self.release(outcome);
            }
            Err(e) => warn!(victim = %report.victim, error = %e, "Deadlock victim could not be cancelled"),
        }
        self.bus.publish(CoordinationEvent::DeadlockResolved {
            victim: report.victim,
            stalled: report.stalled.clone(),
        });
        Some(report)
    }

    // === Persistence ===

    /// Capture the full coordinator state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            agents: self.registry.agents(),
            tasks: self.graph.list(&TaskFilter::default()),
            edges: self.graph.edges(),
            objectives: self.graph.objectives(),
            memory: self.memory.entries(),
            ..Snapshot::new()
        }
    }

    /// Replace the coordinator state with `snapshot`.
    ///
    /// Running dispatches are dropped; tasks that were in flight go back
    /// through readiness. Returns those tasks. On error nothing changes.
    pub fn restore(&self, snapshot: Snapshot) -> Result<Vec<TaskId>> {
        snapshot
            .check_format()
            .map_err(|e| CoordinationError::InvalidSpec(e.to_string()))?;
        let now = Utc::now();
        let reset = self
            .graph
            .restore(snapshot.tasks, snapshot.edges, snapshot.objectives, now)?;

        for (_, (_, handle)) in self.executions.lock().drain() {
            handle.abort();
        }
        self.registry.restore(snapshot.agents, now);
        self.memory.restore(snapshot.memory);
        info!(reset = reset.len(), taken_at = %snapshot.taken_at, "Coordinator restored");
        Ok(reset)
    }

    /// Save a snapshot through the configured store.
    ///
    /// Returns `false` when no store is configured.
    pub async fn save_snapshot(&self) -> anyhow::Result<bool> {
        let Some(store) = &self.snapshots else {
            return Ok(false);
        };
        store.save(&self.snapshot()).await?;
        Ok(true)
    }

    /// Restore from the configured store's latest snapshot, if any.
    pub async fn load_snapshot(&self) -> anyhow::Result<bool> {
        let Some(store) = &self.snapshots else {
            return Ok(false);
        };
        match store.load().await? {
            Some(snapshot) => {
                self.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // === Control loop ===

    /// Drive the coordinator until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(
            tick_ms = self.config.tick_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "Coordinator started"
        );
        let sweeper = tokio::spawn(
            Arc::clone(&self.memory)
                .run_sweeper(self.config.memory_sweep_interval(), shutdown.resubscribe()),
        );

        let mut tick = timer(self.config.tick_interval());
        let mut heartbeat = timer(self.config.heartbeat_interval());
        let mut deadlock = timer(self.config.deadlock_scan_interval());
        let mut snapshot = self
            .config
            .snapshot_interval_ms
            .filter(|_| self.snapshots.is_some())
            .map(|ms| timer(Duration::from_millis(ms)));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick();
                }
                _ = self.wake.notified() => {
                    self.tick();
                }
                _ = heartbeat.tick() => {
                    self.sweep_heartbeats(Utc::now());
                }
                _ = deadlock.tick() => {
                    self.resolve_deadlocks(Utc::now());
                }
                _ = next_tick(&mut snapshot) => {
                    if let Err(e) = self.save_snapshot().await {
                        error!(error = %format!("{e:#}"), "Snapshot failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Coordinator shutting down");
                    break;
                }
            }
        }

        for (_, (_, handle)) in self.executions.lock().drain() {
            handle.abort();
        }
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Memory sweeper ended abnormally");
        }
        if self.save_snapshot().await? {
            info!("Final snapshot saved");
        }
        Ok(())
    }
}

fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Short per-attempt message for the task's error history.
fn attempt_message(error: &CoordinationError) -> String {
    match error {
        CoordinationError::TaskExecution { message, .. } => message.clone(),
        CoordinationError::TaskTimeout { timeout_ms, .. } => {
            format!("task timed out after {timeout_ms}ms")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionOutcome;
    use async_trait::async_trait;
    use hivemind_core::{AccessLevel, Accessor, AgentStatus, TaskStatus};
    use hivemind_memory::PutRequest;
    use hivemind_storage::InMemorySnapshotStore;
    use serde_json::json;
    use std::collections::{BTreeSet, HashSet};

    /// Backend whose behavior is keyed by task name.
    #[derive(Default)]
    struct ScriptedBackend {
        /// Remaining reported failures per task name
        failures: Mutex<HashMap<String, u32>>,
        /// Tasks that never answer
        hang: BTreeSet<String>,
        /// Tasks that hang on their first call only
        hang_once: Mutex<BTreeSet<String>>,
        /// Tasks whose backend call errors out
        crash: BTreeSet<String>,
        calls: Mutex<Vec<(String, AgentId)>>,
        aborted: Mutex<Vec<TaskId>>,
    }

    impl ScriptedBackend {
        fn failing(self, name: &str, times: u32) -> Self {
            self.failures.lock().insert(name.to_string(), times);
            self
        }

        fn hanging(mut self, name: &str) -> Self {
            self.hang.insert(name.to_string());
            self
        }

        fn hanging_once(self, name: &str) -> Self {
            self.hang_once.lock().insert(name.to_string());
            self
        }

        fn crashing(mut self, name: &str) -> Self {
            self.crash.insert(name.to_string());
            self
        }

        fn calls_for(&self, name: &str) -> Vec<AgentId> {
            self.calls
                .lock()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, a)| *a)
                .collect()
        }
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedBackend {
        async fn execute(&self, task: &Task, agent: &Agent) -> anyhow::Result<ExecutionOutcome> {
            self.calls.lock().push((task.name.clone(), agent.id));
            let hang_now = self.hang.contains(&task.name) || self.hang_once.lock().remove(&task.name);
            if hang_now {
                std::future::pending::<()>().await;
            }
            if self.crash.contains(&task.name) {
                anyhow::bail!("worker process exited");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            let fail = match self.failures.lock().get_mut(&task.name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if fail {
                Ok(ExecutionOutcome::failure("boom"))
            } else {
                Ok(ExecutionOutcome::success(json!({ "task": task.name })))
            }
        }

        async fn abort(&self, task_id: TaskId) {
            self.aborted.lock().push(task_id);
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_retry_delay(Duration::from_millis(10), Duration::from_millis(100))
            .with_tick_interval(Duration::from_millis(20))
    }

    fn coordinator(backend: ScriptedBackend) -> (Arc<Coordinator>, Arc<ScriptedBackend>) {
        coordinator_with(config(), backend)
    }

    fn coordinator_with(
        config: CoordinatorConfig,
        backend: ScriptedBackend,
    ) -> (Arc<Coordinator>, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let coordinator = Coordinator::new(config, backend.clone()).unwrap();
        (Arc::new(coordinator), backend)
    }

    fn task_named(c: &Coordinator, name: &str) -> Task {
        c.list_tasks(&TaskFilter::default())
            .into_iter()
            .find(|t| t.name == name)
            .unwrap()
    }

    async fn drive_until(c: &Arc<Coordinator>, done: impl Fn() -> bool) {
        for _ in 0..10_000 {
            c.tick();
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn collect(c: &Coordinator, kind: EventKind) -> Arc<Mutex<Vec<CoordinationEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = c.subscribe(kind, move |e: &CoordinationEvent| -> anyhow::Result<()> {
            sink.lock().push(e.clone());
            Ok(())
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_runs_after_both_parents() {
        let (c, backend) = coordinator(ScriptedBackend::default());
        c.register_agent(AgentDescriptor::new("w1", "coder")).unwrap();
        c.register_agent(AgentDescriptor::new("w2", "coder")).unwrap();
        let objective = c
            .submit_objective(
                ObjectiveSpec::new("join")
                    .task(TaskSpec::new("a"))
                    .task(TaskSpec::new("b"))
                    .task(TaskSpec::new("c"))
                    .edge("a", "c")
                    .edge("b", "c"),
            )
            .unwrap();
        assert_eq!(task_named(&c, "c").status, TaskStatus::Pending);

        drive_until(&c, || {
            c.objective_status(objective).unwrap().status.is_terminal()
        })
        .await;

        assert_eq!(
            c.objective_status(objective).unwrap().status,
            ObjectiveStatus::Completed
        );
        let order: Vec<String> = backend.calls.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(order.len(), 3);
        assert_eq!(order.last().map(String::as_str), Some("c"));
        assert_eq!(task_named(&c, "c").result, Some(json!({ "task": "c" })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_healthier_agent() {
        let (c, backend) = coordinator(ScriptedBackend::default());
        let weak = c.register_agent(AgentDescriptor::new("weak", "coder")).unwrap();
        let strong = c.register_agent(AgentDescriptor::new("strong", "coder")).unwrap();
        c.heartbeat(weak, HeartbeatMetrics::with_health(Utc::now(), 0.6))
            .unwrap();
        c.heartbeat(strong, HeartbeatMetrics::with_health(Utc::now(), 0.9))
            .unwrap();
        let task = c.add_task(TaskSpec::new("only"), &[]).unwrap();

        let report = c.tick();
        assert_eq!(report.assigned, vec![(task, strong)]);
        drive_until(&c, || c.get_task_status(task).unwrap().is_terminal()).await;
        assert_eq!(backend.calls_for("only"), vec![strong]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_fails_terminally_and_cancels_dependents() {
        let (c, backend) = coordinator(ScriptedBackend::default().failing("flaky", u32::MAX));
        let failed = collect(&c, EventKind::TaskFailed);
        let retries = collect(&c, EventKind::TaskRetryScheduled);
        let agent = c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let objective = c
            .submit_objective(
                ObjectiveSpec::new("doomed")
                    .task(TaskSpec::new("flaky").with_max_attempts(3))
                    .task(TaskSpec::new("after"))
                    .edge("flaky", "after"),
            )
            .unwrap();

        drive_until(&c, || {
            c.objective_status(objective).unwrap().status.is_terminal()
        })
        .await;

        let flaky = task_named(&c, "flaky");
        assert_eq!(flaky.status, TaskStatus::Failed);
        assert_eq!(flaky.attempt, 3);
        assert_eq!(
            flaky.last_error.as_deref(),
            Some("attempt 3/3: boom <- attempt 2/3: boom <- attempt 1/3: boom")
        );
        assert_eq!(task_named(&c, "after").status, TaskStatus::Cancelled);
        assert_eq!(
            c.objective_status(objective).unwrap().status,
            ObjectiveStatus::Failed
        );
        assert_eq!(backend.calls_for("flaky").len(), 3);
        assert_eq!(failed.lock().len(), 3);
        assert_eq!(retries.lock().len(), 2);

        let agent = c.get_agent_status(agent).unwrap();
        assert_eq!(agent.tasks_failed, 3);
        assert!((agent.health - 0.97).abs() < 1e-9);
        assert!(agent.current_task_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_one_failure() {
        let (c, _backend) = coordinator(ScriptedBackend::default().failing("once", 1));
        c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let task = c.add_task(TaskSpec::new("once"), &[]).unwrap();

        drive_until(&c, || c.get_task_status(task).unwrap().is_terminal()).await;

        let task = c.get_task_status(task).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.error_history, vec!["boom".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_critical_failure() {
        let (c, backend) = coordinator(ScriptedBackend::default().hanging("slow"));
        let agent = c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let task = c
            .add_task(
                TaskSpec::new("slow").with_timeout_ms(50).with_max_attempts(1),
                &[],
            )
            .unwrap();

        drive_until(&c, || c.get_task_status(task).unwrap().is_terminal()).await;

        let task_state = c.get_task_status(task).unwrap();
        assert_eq!(task_state.status, TaskStatus::Failed);
        assert_eq!(
            task_state.last_error.as_deref(),
            Some("attempt 1/1: task timed out after 50ms")
        );
        let agent = c.get_agent_status(agent).unwrap();
        assert!((agent.health - 0.8).abs() < 1e-9);
        assert!(backend.aborted.lock().contains(&task));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_crash_is_critical_failure() {
        let (c, _backend) = coordinator(ScriptedBackend::default().crashing("bad"));
        let agent = c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let task = c
            .add_task(TaskSpec::new("bad").with_max_attempts(1), &[])
            .unwrap();

        drive_until(&c, || c.get_task_status(task).unwrap().is_terminal()).await;

        let task = c.get_task_status(task).unwrap();
        assert_eq!(
            task.last_error.as_deref(),
            Some("attempt 1/1: worker process exited")
        );
        assert!((c.get_agent_status(agent).unwrap().health - 0.8).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_tasks_are_reclaimed() {
        let (c, backend) = coordinator(ScriptedBackend::default().hanging_once("job"));
        let timeouts = collect(&c, EventKind::AgentHeartbeatTimeout);
        let silent = c.register_agent(AgentDescriptor::new("silent", "coder")).unwrap();
        let task = c.add_task(TaskSpec::new("job"), &[]).unwrap();

        drive_until(&c, || {
            c.get_task_status(task).unwrap().status == TaskStatus::Running
        })
        .await;
        let healthy = c.register_agent(AgentDescriptor::new("healthy", "coder")).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(31);
        c.heartbeat(healthy, HeartbeatMetrics::alive(later)).unwrap();
        assert_eq!(c.sweep_heartbeats(later), vec![silent]);

        let reclaimed = c.get_task_status(task).unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Ready);
        assert_eq!(reclaimed.attempt, 0);
        assert_eq!(c.get_agent_status(silent).unwrap().status, AgentStatus::Error);
        match &timeouts.lock()[..] {
            [CoordinationEvent::AgentHeartbeatTimeout { agent_id, reclaimed }] => {
                assert_eq!(*agent_id, silent);
                assert_eq!(reclaimed, &vec![task]);
            }
            other => panic!("unexpected events: {other:?}"),
        }

        drive_until(&c, || c.get_task_status(task).unwrap().is_terminal()).await;
        assert_eq!(
            c.get_task_status(task).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(backend.calls_for("job"), vec![silent, healthy]);
        tokio::task::yield_now().await;
        assert!(backend.aborted.lock().contains(&task));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ticks_never_double_assign() {
        let mut backend = ScriptedBackend::default();
        for i in 0..20 {
            backend = backend.hanging(&format!("t{i}"));
        }
        let (c, _backend) = coordinator(backend);
        let assigned = collect(&c, EventKind::TaskAssigned);
        for i in 0..6 {
            c.register_agent(
                AgentDescriptor::new(format!("w{i}"), "specialist").with_max_concurrent_tasks(2),
            )
            .unwrap();
        }
        for i in 0..20 {
            c.add_task(TaskSpec::new(format!("t{i}")), &[]).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move { c.tick() }));
        }
        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap().assigned);
        }

        // A quiet tick fills whatever slots lost races left open.
        claimed.extend(c.tick().assigned);

        let unique: HashSet<TaskId> = claimed.iter().map(|(t, _)| *t).collect();
        assert_eq!(unique.len(), claimed.len());
        assert_eq!(assigned.lock().len(), claimed.len());

        // Six agents with two slots each.
        assert_eq!(claimed.len(), 12);
        for agent in c.query_agents(&AgentQuery::default()) {
            let held: Vec<TaskId> = c
                .list_tasks(&TaskFilter {
                    agent_id: Some(agent.id),
                    ..Default::default()
                })
                .into_iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(held.len(), agent.current_task_ids.len());
            assert!(held.len() <= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_cancels_lowest_priority_stalled_task() {
        let config = config().with_deadlock_grace(Duration::from_secs(1));
        let (c, _backend) = coordinator_with(config, ScriptedBackend::default());
        let resolved = collect(&c, EventKind::DeadlockResolved);
        c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let gpu = c
            .add_task(TaskSpec::new("gpu").requires("gpu").with_priority(1), &[])
            .unwrap();
        let quantum = c
            .add_task(TaskSpec::new("quantum").requires("qpu").with_priority(5), &[])
            .unwrap();

        let report = c.tick();
        assert_eq!(report.unassignable.len(), 2);
        assert!(c.resolve_deadlocks(Utc::now()).is_none());

        let report = c
            .resolve_deadlocks(Utc::now() + chrono::Duration::seconds(2))
            .unwrap();
        assert_eq!(report.victim, gpu);
        assert_eq!(c.get_task_status(gpu).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(c.get_task_status(quantum).unwrap().status, TaskStatus::Ready);
        assert_eq!(resolved.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_spares_task_once_capacity_frees() {
        let config = config().with_deadlock_grace(Duration::from_secs(1));
        let (c, _backend) = coordinator_with(config, ScriptedBackend::default().hanging("long"));
        let resolved = collect(&c, EventKind::DeadlockResolved);
        let agent = c
            .register_agent(AgentDescriptor::new("w", "specialist").with_max_concurrent_tasks(1))
            .unwrap();
        let long = c.add_task(TaskSpec::new("long"), &[]).unwrap();
        let queued = c.add_task(TaskSpec::new("queued"), &[]).unwrap();

        drive_until(&c, || {
            c.get_task_status(long).unwrap().status == TaskStatus::Running
        })
        .await;
        let report = c.tick();
        assert!(report.unassignable.contains(&queued));

        c.cancel_task(long, "user request").unwrap();
        assert!(c
            .resolve_deadlocks(Utc::now() + chrono::Duration::seconds(2))
            .is_none());
        assert_eq!(c.get_task_status(queued).unwrap().status, TaskStatus::Ready);
        assert!(resolved.lock().is_empty());

        let report = c.tick();
        assert_eq!(report.assigned, vec![(queued, agent)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task_frees_agent() {
        let (c, backend) = coordinator(ScriptedBackend::default().hanging("long"));
        let agent = c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let long = c.add_task(TaskSpec::new("long"), &[]).unwrap();
        let next = c.add_task(TaskSpec::new("next"), &[long]).unwrap();

        drive_until(&c, || {
            c.get_task_status(long).unwrap().status == TaskStatus::Running
        })
        .await;
        let cancelled = c.cancel_task(long, "user request").unwrap();
        assert_eq!(cancelled, vec![long, next]);

        let agent = c.get_agent_status(agent).unwrap();
        assert!(agent.current_task_ids.is_empty());
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.tasks_failed, 0);
        tokio::task::yield_now().await;
        assert!(backend.aborted.lock().contains(&long));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_returns_tasks_to_frontier() {
        let (c, _backend) = coordinator(ScriptedBackend::default().hanging("held"));
        let agent = c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let task = c.add_task(TaskSpec::new("held"), &[]).unwrap();
        drive_until(&c, || {
            c.get_task_status(task).unwrap().status == TaskStatus::Running
        })
        .await;

        assert_eq!(c.deregister_agent(agent).unwrap(), vec![task]);
        assert_eq!(c.list_ready_tasks().len(), 1);
        assert!(c.get_agent_status(agent).is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_cycle() {
        let (c, _backend) = coordinator(ScriptedBackend::default());
        let err = c
            .submit_objective(
                ObjectiveSpec::new("loop")
                    .task(TaskSpec::new("a"))
                    .task(TaskSpec::new("b"))
                    .edge("a", "b")
                    .edge("b", "a"),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinationError::DependencyCycle { .. }));
        assert!(c.list_tasks(&TaskFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restores_into_fresh_coordinator() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let first = Coordinator::new(config(), Arc::new(ScriptedBackend::default()))
            .unwrap()
            .with_snapshot_store(store.clone());
        let agent = first
            .register_agent(AgentDescriptor::new("w", "coder"))
            .unwrap();
        let objective = first
            .submit_objective(
                ObjectiveSpec::new("o")
                    .task(TaskSpec::new("a"))
                    .task(TaskSpec::new("b"))
                    .edge("a", "b"),
            )
            .unwrap();
        first
            .memory()
            .put(
                &Accessor::System,
                PutRequest::new("notes", "plan", json!("ship it")).with_access(AccessLevel::Public),
            )
            .unwrap();
        assert!(first.save_snapshot().await.unwrap());

        let second = Coordinator::new(config(), Arc::new(ScriptedBackend::default()))
            .unwrap()
            .with_snapshot_store(store);
        assert!(second.load_snapshot().await.unwrap());

        assert!(second.get_agent_status(agent).is_ok());
        assert_eq!(second.list_ready_tasks().len(), 1);
        assert_eq!(second.list_ready_tasks()[0].name, "a");
        assert_eq!(second.objective_status(objective).unwrap().total, 2);
        let note = second
            .memory()
            .get(&Accessor::External, "notes", "plan")
            .unwrap()
            .unwrap();
        assert_eq!(note.value, json!("ship it"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_completes_objective() {
        let (c, _backend) = coordinator(ScriptedBackend::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = tokio::spawn(Arc::clone(&c).run(shutdown_rx));

        c.register_agent(AgentDescriptor::new("w", "coder")).unwrap();
        let objective = c
            .submit_objective(
                ObjectiveSpec::new("pipeline")
                    .task(TaskSpec::new("fetch"))
                    .task(TaskSpec::new("build"))
                    .task(TaskSpec::new("ship"))
                    .edge("fetch", "build")
                    .edge("build", "ship"),
            )
            .unwrap();

        let status = c.wait_for_objective(objective).await.unwrap();
        assert_eq!(status, ObjectiveStatus::Completed);

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_objective_and_purge() {
        let (c, _backend) = coordinator(ScriptedBackend::default());
        let objective = c
            .submit_objective(
                ObjectiveSpec::new("o")
                    .task(TaskSpec::new("a"))
                    .task(TaskSpec::new("b")),
            )
            .unwrap();
        assert_eq!(c.cancel_objective(objective).unwrap().len(), 2);
        assert_eq!(
            c.objective_status(objective).unwrap().status,
            ObjectiveStatus::Cancelled
        );

        let purged = c.purge_terminal(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(purged.len(), 2);
        assert!(c.objective_status(objective).is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.max_workload = 2.0;
        let result = Coordinator::new(config, Arc::new(ScriptedBackend::default()));
        assert!(matches!(result, Err(CoordinationError::InvalidSpec(_))));
    }
}
