//! Task Graph Manager.
//!
//! Owns every task, every dependency edge and the objectives tasks were
//! submitted under. It validates acyclicity when edges are inserted,
//! maintains the ready frontier, and applies the per-task state machine:
//!
//! ```text
//! pending → ready → assigned → running → completed
//!                                  └──→ failed ─→ ready (retry)
//!                                          └──→ failed (terminal)
//! any non-terminal state → cancelled
//! ```
//!
//! The graph never picks agents. State changes are compare-and-swap on the
//! task's `version` (assignment) or on the assigned agent (everything
//! after), so a stale caller gets an error instead of clobbering state.
//! Events are queued while the internal lock is held and delivered after it
//! is released, in the order the changes were applied.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use hivemind_core::{
    AgentId, CoordinationError, CoordinationEvent, DependencyEdge, EventBus, Objective,
    ObjectiveId, ObjectiveProgress, ObjectiveSpec, ObjectiveStatus, Result, Task, TaskFilter,
    TaskId, TaskSpec, TaskStatus, Time, TopologyStrategy,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

const UPSTREAM_CANCELLED: &str = "upstream cancelled";
const UPSTREAM_FAILED: &str = "upstream failed";

/// Tasks released by a cancellation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelOutcome {
    /// Every task that moved to `cancelled`, root first
    pub cancelled: Vec<TaskId>,
    /// In-flight tasks whose agent slot must be released
    pub released: Vec<(TaskId, AgentId)>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    /// Failed attempts so far
    pub attempt: u32,
    /// Whether the attempt budget is exhausted
    pub terminal: bool,
    /// Backoff before the task becomes ready again
    pub retry_delay: Option<Duration>,
    /// Dependents cancelled because the task failed terminally
    pub cancelled: Vec<TaskId>,
}

#[derive(Default)]
struct GraphInner {
    tasks: HashMap<TaskId, Task>,
    /// from -> tasks waiting on it
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    objectives: HashMap<ObjectiveId, Objective>,
}

impl GraphInner {
    fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks.get(&id).ok_or(CoordinationError::TaskNotFound(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or(CoordinationError::TaskNotFound(id))
    }

    /// Path from `start` to `target` following dependent edges.
    fn path_between(&self, start: TaskId, target: TaskId) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        self.walk(start, target, &mut visited, &mut path)
            .then_some(path)
    }

    fn walk(
        &self,
        node: TaskId,
        target: TaskId,
        visited: &mut HashSet<TaskId>,
        path: &mut Vec<TaskId>,
    ) -> bool {
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        if node == target {
            return true;
        }
        if let Some(next) = self.dependents.get(&node) {
            for &dependent in next {
                if self.walk(dependent, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Insert `from → to`, rejecting edges that would close a cycle.
    fn insert_edge(&mut self, from: TaskId, to: TaskId) -> Result<()> {
        self.task(from)?;
        self.task(to)?;
        if from == to {
            return Err(CoordinationError::DependencyCycle {
                path: vec![from, from],
            });
        }
        // A cycle exists iff `to` already reaches `from`.
        if let Some(path) = self.path_between(to, from) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from);
            cycle.extend(path);
            return Err(CoordinationError::DependencyCycle { path: cycle });
        }
        self.dependents.entry(from).or_default().insert(to);
        self.task_mut(to)?.dependencies.insert(from);
        Ok(())
    }

    fn remove_edges_of(&mut self, id: TaskId) {
        if let Some(dependents) = self.dependents.remove(&id) {
            for dependent in dependents {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.dependencies.remove(&id);
                }
            }
        }
        let dependencies = self
            .tasks
            .get(&id)
            .map(|t| t.dependencies.clone())
            .unwrap_or_default();
        for dependency in dependencies {
            if let Some(set) = self.dependents.get_mut(&dependency) {
                set.remove(&id);
            }
        }
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Move a pending task to ready if all its dependencies completed.
    fn promote(&mut self, id: TaskId, now: Time, events: &mut Vec<CoordinationEvent>) -> bool {
        let ready = match self.tasks.get(&id) {
            Some(task) => task.status == TaskStatus::Pending && self.dependencies_completed(task),
            None => false,
        };
        if ready {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.transition(TaskStatus::Ready, now);
                debug!(task_id = %id, name = %task.name, "Task ready");
                events.push(CoordinationEvent::TaskReady { task_id: id });
            }
        }
        ready
    }

    fn promote_dependents(
        &mut self,
        id: TaskId,
        now: Time,
        events: &mut Vec<CoordinationEvent>,
    ) -> Vec<TaskId> {
        let dependents: Vec<_> = self
            .dependents
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        dependents
            .into_iter()
            .filter(|&dependent| self.promote(dependent, now, events))
            .collect()
    }

    fn cancel_one(
        &mut self,
        id: TaskId,
        reason: &str,
        now: Time,
        events: &mut Vec<CoordinationEvent>,
    ) -> Option<AgentId> {
        let task = self.tasks.get_mut(&id)?;
        let released = task
            .status
            .is_in_flight()
            .then_some(task.assigned_agent_id)
            .flatten();
        task.transition(TaskStatus::Cancelled, now);
        task.assigned_agent_id = None;
        task.retry_at = None;
        task.finished_at = Some(now);
        task.last_error = Some(reason.to_string());
        debug!(task_id = %id, reason, "Task cancelled");
        events.push(CoordinationEvent::TaskCancelled {
            task_id: id,
            reason: reason.to_string(),
        });
        released
    }

    /// Cancel every not-yet-started transitive dependent of `root`.
    fn cancel_downstream(
        &mut self,
        root: TaskId,
        reason: &str,
        now: Time,
        events: &mut Vec<CoordinationEvent>,
    ) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue: VecDeque<TaskId> = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let next: Vec<_> = self
                .dependents
                .get(&id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for dependent in next {
                if !seen.insert(dependent) {
                    continue;
                }
                if self
                    .tasks
                    .get(&dependent)
                    .is_some_and(|t| t.is_not_started())
                {
                    self.cancel_one(dependent, reason, now, events);
                    cancelled.push(dependent);
                }
                queue.push_back(dependent);
            }
        }
        cancelled
    }

    /// Close the objective once every member task is terminal.
    fn settle_objective(
        &mut self,
        objective_id: Option<ObjectiveId>,
        now: Time,
        events: &mut Vec<CoordinationEvent>,
    ) {
        let Some(objective_id) = objective_id else {
            return;
        };
        let Some(objective) = self.objectives.get(&objective_id) else {
            return;
        };
        if objective.status.is_terminal() {
            return;
        }
        let members: Vec<&Task> = objective
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect();
        if !members.iter().all(|t| t.is_terminal()) {
            return;
        }
        let status = if members.iter().all(|t| t.status == TaskStatus::Completed) {
            ObjectiveStatus::Completed
        } else {
            ObjectiveStatus::Failed
        };
        if let Some(objective) = self.objectives.get_mut(&objective_id) {
            objective.status = status;
            objective.completed_at = Some(now);
            info!(objective_id = %objective_id, ?status, "Objective finished");
            events.push(CoordinationEvent::ObjectiveCompleted {
                objective_id,
                status,
            });
        }
    }

    /// Find a cycle among non-terminal tasks.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();
        let mut ids: Vec<_> = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id)
            .collect();
        ids.sort();
        for id in ids {
            if visited.contains(&id) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.cycle_from(id, &mut visited, &mut recursion_stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn cycle_from(
        &self,
        node: TaskId,
        visited: &mut HashSet<TaskId>,
        recursion_stack: &mut HashSet<TaskId>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        visited.insert(node);
        recursion_stack.insert(node);
        path.push(node);

        if let Some(dependents) = self.dependents.get(&node) {
            for &next in dependents {
                if self.tasks.get(&next).map_or(true, |t| t.is_terminal()) {
                    continue;
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = self.cycle_from(next, visited, recursion_stack, path) {
                        return Some(cycle);
                    }
                } else if recursion_stack.contains(&next) {
                    let start = path.iter().position(|id| *id == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
            }
        }

        path.pop();
        recursion_stack.remove(&node);
        None
    }
}

/// Owns tasks, edges and objectives.
pub struct TaskGraph {
    inner: Mutex<GraphInner>,
    /// Events waiting for delivery, in mutation order
    outbox: Mutex<VecDeque<CoordinationEvent>>,
    /// Held by the thread currently delivering the outbox
    draining: Mutex<()>,
    bus: EventBus,
    default_max_attempts: u32,
    default_timeout_ms: u64,
}

impl TaskGraph {
    /// Create an empty graph publishing on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(GraphInner::default()),
            outbox: Mutex::new(VecDeque::new()),
            draining: Mutex::new(()),
            bus,
            default_max_attempts: 3,
            default_timeout_ms: 300_000,
        }
    }

    /// Defaults applied to specs that leave attempts or timeout unset.
    pub fn with_defaults(mut self, max_attempts: u32, timeout_ms: u64) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Queue events. Call with the state lock held.
    fn enqueue(&self, events: impl IntoIterator<Item = CoordinationEvent>) {
        self.outbox.lock().extend(events);
    }

    /// Deliver queued events. Call after the state lock is released.
    ///
    /// One thread drains at a time; a caller that finds another thread
    /// draining leaves its events to it. Handlers may call back into the
    /// graph: their events join the queue behind the current ones.
    fn flush(&self) {
        loop {
            let Some(drain) = self.draining.try_lock() else {
                return;
            };
            loop {
                let next = self.outbox.lock().pop_front();
                match next {
                    Some(event) => {
                        self.bus.publish(event);
                    }
                    None => break,
                }
            }
            drop(drain);
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }

    fn build_task(&self, spec: TaskSpec, objective_id: Option<ObjectiveId>, now: Time) -> Task {
        Task::from_spec(
            spec,
            objective_id,
            self.default_max_attempts,
            self.default_timeout_ms,
            now,
        )
    }

    /// Submit a set of named tasks and the edges between them.
    ///
    /// The whole objective is rejected, leaving the graph unchanged, if a
    /// name is duplicated, an edge names an unknown task, or the edges
    /// contain a cycle.
    pub fn submit_objective(&self, spec: ObjectiveSpec, now: Time) -> Result<ObjectiveId> {
        validate_objective(&spec)?;

        let objective_id = ObjectiveId::new();
        let task_count = spec.tasks.len();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();

            let mut by_name = HashMap::with_capacity(task_count);
            let mut task_ids = Vec::with_capacity(task_count);
            for task_spec in spec.tasks {
                let name = task_spec.name.clone();
                let task = self.build_task(task_spec, Some(objective_id), now);
                by_name.insert(name, task.id);
                task_ids.push(task.id);
                inner.tasks.insert(task.id, task);
            }

            for edge in &spec.edges {
                let (from, to) = (by_name[&edge.from], by_name[&edge.to]);
                if let Err(e) = inner.insert_edge(from, to) {
                    for id in &task_ids {
                        inner.dependents.remove(id);
                        inner.tasks.remove(id);
                    }
                    warn!(error = %e, "Objective rejected");
                    return Err(e);
                }
            }

            inner.objectives.insert(
                objective_id,
                Objective {
                    id: objective_id,
                    description: spec.description,
                    strategy: spec.strategy,
                    task_ids: task_ids.clone(),
                    status: ObjectiveStatus::Active,
                    created_at: now,
                    completed_at: None,
                },
            );
            events.push(CoordinationEvent::ObjectiveSubmitted {
                objective_id,
                task_count,
            });
            for id in task_ids {
                inner.promote(id, now, &mut events);
            }
            self.enqueue(events);
        }
        info!(objective_id = %objective_id, tasks = task_count, "Objective submitted");
        self.flush();
        Ok(objective_id)
    }

    /// Add a standalone task that waits on `dependencies`.
    pub fn add_task(&self, spec: TaskSpec, dependencies: &[TaskId], now: Time) -> Result<TaskId> {
        if spec.name.trim().is_empty() {
            return Err(CoordinationError::InvalidSpec(
                "task name must not be empty".to_string(),
            ));
        }
        let task = self.build_task(spec, None, now);
        let id = task.id;
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.tasks.insert(id, task);
            for &dependency in dependencies {
                if let Err(e) = inner.insert_edge(dependency, id) {
                    inner.remove_edges_of(id);
                    inner.tasks.remove(&id);
                    return Err(e);
                }
            }
            inner.promote(id, now, &mut events);
            self.enqueue(events);
        }
        debug!(task_id = %id, "Task added");
        self.flush();
        Ok(id)
    }

    /// Make `to` wait for `from`.
    ///
    /// Rejected if it would close a cycle or if `to` has already started.
    /// A ready `to` falls back to pending until `from` completes.
    pub fn add_dependency(&self, from: TaskId, to: TaskId, now: Time) -> Result<()> {
        let mut inner = self.inner.lock();
        let target = inner.task(to)?;
        if !matches!(target.status, TaskStatus::Pending | TaskStatus::Ready) {
            return Err(CoordinationError::InvalidSpec(format!(
                "task {to} is already {}",
                target.status
            )));
        }
        let source = inner.task(from)?;
        if source.is_terminal() && source.status != TaskStatus::Completed {
            return Err(CoordinationError::InvalidSpec(format!(
                "dependency {from} is {} and can never complete",
                source.status
            )));
        }
        let source_done = source.status == TaskStatus::Completed;

        inner.insert_edge(from, to)?;
        let task = inner.task_mut(to)?;
        if task.status == TaskStatus::Ready && !source_done {
            task.transition(TaskStatus::Pending, now);
        }
        Ok(())
    }

    /// A copy of the task.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().tasks.get(&id).cloned()
    }

    /// Tasks passing `filter`, oldest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// The ready frontier, highest priority first.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready
    }

    /// Every dependency edge.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let inner = self.inner.lock();
        let mut edges: Vec<DependencyEdge> = inner
            .dependents
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| DependencyEdge { from, to }))
            .collect();
        edges.sort();
        edges
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.inner
            .lock()
            .dependents
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topology of the objective owning `task`.
    pub fn strategy_for(&self, task: &Task) -> TopologyStrategy {
        task.objective_id
            .and_then(|id| self.inner.lock().objectives.get(&id).map(|o| o.strategy))
            .unwrap_or_default()
    }

    /// Number of assigned or running tasks.
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .count()
    }

    /// Number of failed tasks waiting out their backoff.
    pub fn retry_pending_count(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.retry_at.is_some())
            .count()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a ready task for `agent_id`.
    ///
    /// Fails with [`CoordinationError::AssignmentConflict`] unless the task
    /// is still ready at `expected_version`.
    pub fn try_assign(
        &self,
        task_id: TaskId,
        expected_version: u64,
        agent_id: AgentId,
        now: Time,
    ) -> Result<Task> {
        let task = {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(task_id)?;
            if task.status != TaskStatus::Ready || task.version != expected_version {
                return Err(CoordinationError::AssignmentConflict { task_id });
            }
            task.transition(TaskStatus::Assigned, now);
            task.assigned_agent_id = Some(agent_id);
            let task = task.clone();
            self.enqueue([CoordinationEvent::TaskAssigned {
                task_id,
                agent_id,
                attempt: task.attempt + 1,
            }]);
            task
        };
        info!(task_id = %task_id, agent_id = %agent_id, attempt = task.attempt + 1, "Task assigned");
        self.flush();
        Ok(task)
    }

    /// The assigned agent started executing.
    pub fn mark_running(&self, task_id: TaskId, agent_id: AgentId, now: Time) -> Result<Task> {
        let task = {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(task_id)?;
            if task.status != TaskStatus::Assigned || task.assigned_agent_id != Some(agent_id) {
                return Err(CoordinationError::InvalidTransition {
                    task_id,
                    from: task.status,
                    to: TaskStatus::Running,
                });
            }
            task.transition(TaskStatus::Running, now);
            task.started_at = Some(now);
            let task = task.clone();
            self.enqueue([CoordinationEvent::TaskRunning { task_id, agent_id }]);
            task
        };
        debug!(task_id = %task_id, agent_id = %agent_id, "Task running");
        self.flush();
        Ok(task)
    }

    /// Record a successful result and promote dependents.
    ///
    /// Returns the tasks that became ready. Results from an agent that no
    /// longer holds the task are rejected.
    pub fn complete(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        output: serde_json::Value,
        duration_ms: u64,
        now: Time,
    ) -> Result<Vec<TaskId>> {
        let mut events = Vec::new();
        let newly_ready = {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(task_id)?;
            if !task.status.is_in_flight() || task.assigned_agent_id != Some(agent_id) {
                return Err(CoordinationError::InvalidTransition {
                    task_id,
                    from: task.status,
                    to: TaskStatus::Completed,
                });
            }
            task.transition(TaskStatus::Completed, now);
            task.result = Some(output);
            task.assigned_agent_id = None;
            task.finished_at = Some(now);
            let objective_id = task.objective_id;
            events.push(CoordinationEvent::TaskCompleted {
                task_id,
                agent_id,
                duration_ms,
            });

            let newly_ready = inner.promote_dependents(task_id, now, &mut events);
            inner.settle_objective(objective_id, now, &mut events);
            self.enqueue(events);
            newly_ready
        };
        info!(task_id = %task_id, agent_id = %agent_id, duration_ms, "Task completed");
        self.flush();
        Ok(newly_ready)
    }

    /// Record a failed attempt.
    ///
    /// While attempts remain the task waits in `failed` with `retry_at`
    /// set; `backoff` maps the failed-attempt count to a delay. Once the
    /// budget is exhausted the failure is terminal and every not-started
    /// transitive dependent is cancelled.
    pub fn fail(
        &self,
        task_id: TaskId,
        agent_id: Option<AgentId>,
        error: String,
        now: Time,
        backoff: impl FnOnce(u32) -> Duration,
    ) -> Result<FailureOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let task = inner.task_mut(task_id)?;
            let holder_matches = agent_id.is_none() || task.assigned_agent_id == agent_id;
            if !task.status.is_in_flight() || !holder_matches {
                return Err(CoordinationError::InvalidTransition {
                    task_id,
                    from: task.status,
                    to: TaskStatus::Failed,
                });
            }
            let failed_agent = task.assigned_agent_id;
            task.attempt += 1;
            task.error_history.push(error.clone());
            task.last_error = task.error_chain();
            task.assigned_agent_id = None;
            task.started_at = None;

            let attempt = task.attempt;
            let terminal = attempt >= task.max_attempts;
            let retry_delay = (!terminal).then(|| backoff(attempt));
            task.retry_at = retry_delay.map(|d| retry_deadline(now, d));
            if terminal {
                task.finished_at = Some(now);
            }
            task.transition(TaskStatus::Failed, now);
            let objective_id = task.objective_id;

            events.push(CoordinationEvent::TaskFailed {
                task_id,
                agent_id: failed_agent,
                error,
                attempt,
                terminal,
            });

            let cancelled = if terminal {
                let cancelled = inner.cancel_downstream(task_id, UPSTREAM_FAILED, now, &mut events);
                inner.settle_objective(objective_id, now, &mut events);
                cancelled
            } else {
                if let Some(delay) = retry_delay {
                    events.push(CoordinationEvent::TaskRetryScheduled {
                        task_id,
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Vec::new()
            };

            self.enqueue(events);
            FailureOutcome {
                attempt,
                terminal,
                retry_delay,
                cancelled,
            }
        };
        self.flush();
        Ok(outcome)
    }

    /// Return a task waiting out its backoff to the ready frontier.
    pub fn release_retry(&self, task_id: TaskId, now: Time) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            match inner.tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Failed && task.retry_at.is_some() => {
                    task.retry_at = None;
                    task.transition(TaskStatus::Ready, now);
                    self.enqueue([CoordinationEvent::TaskReady { task_id }]);
                    true
                }
                _ => false,
            }
        };
        if released {
            debug!(task_id = %task_id, "Task ready for retry");
            self.flush();
        }
        released
    }

    /// Take an in-flight task back from an agent that went away.
    ///
    /// The task returns to ready without consuming an attempt.
    pub fn reclaim(&self, task_id: TaskId, agent_id: AgentId, now: Time) -> bool {
        let reclaimed = {
            let mut inner = self.inner.lock();
            match inner.tasks.get_mut(&task_id) {
                Some(task)
                    if task.status.is_in_flight() && task.assigned_agent_id == Some(agent_id) =>
                {
                    task.assigned_agent_id = None;
                    task.started_at = None;
                    task.transition(TaskStatus::Ready, now);
                    self.enqueue([CoordinationEvent::TaskReady { task_id }]);
                    true
                }
                _ => false,
            }
        };
        if reclaimed {
            debug!(task_id = %task_id, agent_id = %agent_id, "Task reclaimed");
            self.flush();
        }
        reclaimed
    }

    /// Cancel a task and every not-yet-started transitive dependent.
    ///
    /// Cancelling an already-cancelled task is a no-op; completed and
    /// terminally failed tasks cannot be cancelled.
    pub fn cancel(&self, task_id: TaskId, reason: &str, now: Time) -> Result<CancelOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let task = inner.task(task_id)?;
            if task.status == TaskStatus::Cancelled {
                return Ok(CancelOutcome::default());
            }
            if task.is_terminal() {
                return Err(CoordinationError::InvalidTransition {
                    task_id,
                    from: task.status,
                    to: TaskStatus::Cancelled,
                });
            }

            let mut outcome = CancelOutcome::default();
            if let Some(agent_id) = inner.cancel_one(task_id, reason, now, &mut events) {
                outcome.released.push((task_id, agent_id));
            }
            outcome.cancelled.push(task_id);
            let downstream = inner.cancel_downstream(task_id, UPSTREAM_CANCELLED, now, &mut events);
            outcome.cancelled.extend(downstream);

            let objectives: BTreeSet<ObjectiveId> = outcome
                .cancelled
                .iter()
                .filter_map(|id| inner.tasks.get(id).and_then(|t| t.objective_id))
                .collect();
            for objective_id in objectives {
                inner.settle_objective(Some(objective_id), now, &mut events);
            }
            self.enqueue(events);
            outcome
        };
        info!(task_id = %task_id, cancelled = outcome.cancelled.len(), reason, "Cancellation applied");
        self.flush();
        Ok(outcome)
    }

    /// Cancel the task if needed, then drop it and its edges.
    pub fn remove_task(&self, task_id: TaskId, now: Time) -> Result<CancelOutcome> {
        let outcome = match self.cancel(task_id, "removed", now) {
            Ok(outcome) => outcome,
            Err(CoordinationError::InvalidTransition { .. }) => CancelOutcome::default(),
            Err(e) => return Err(e),
        };
        let mut inner = self.inner.lock();
        inner.remove_edges_of(task_id);
        if let Some(task) = inner.tasks.remove(&task_id) {
            if let Some(objective) = task.objective_id.and_then(|id| inner.objectives.get_mut(&id)) {
                objective.task_ids.retain(|id| *id != task_id);
            }
        }
        Ok(outcome)
    }

    /// Cancel every non-terminal task of an objective.
    pub fn cancel_objective(&self, objective_id: ObjectiveId, now: Time) -> Result<CancelOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            let objective = inner
                .objectives
                .get(&objective_id)
                .ok_or(CoordinationError::ObjectiveNotFound(objective_id))?;
            if objective.status.is_terminal() {
                return Ok(CancelOutcome::default());
            }
            let members = objective.task_ids.clone();

            let mut outcome = CancelOutcome::default();
            for id in members {
                if inner.tasks.get(&id).map_or(true, |t| t.is_terminal()) {
                    continue;
                }
                if let Some(agent_id) = inner.cancel_one(id, "objective cancelled", now, &mut events) {
                    outcome.released.push((id, agent_id));
                }
                outcome.cancelled.push(id);
            }

            if let Some(objective) = inner.objectives.get_mut(&objective_id) {
                objective.status = ObjectiveStatus::Cancelled;
                objective.completed_at = Some(now);
            }
            events.push(CoordinationEvent::ObjectiveCompleted {
                objective_id,
                status: ObjectiveStatus::Cancelled,
            });
            self.enqueue(events);
            outcome
        };
        info!(objective_id = %objective_id, cancelled = outcome.cancelled.len(), "Objective cancelled");
        self.flush();
        Ok(outcome)
    }

    /// A copy of the objective.
    pub fn objective(&self, id: ObjectiveId) -> Option<Objective> {
        self.inner.lock().objectives.get(&id).cloned()
    }

    /// Every objective, oldest first.
    pub fn objectives(&self) -> Vec<Objective> {
        let mut objectives: Vec<Objective> =
            self.inner.lock().objectives.values().cloned().collect();
        objectives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        objectives
    }

    /// Per-status counts and completion ratio of an objective.
    pub fn objective_progress(&self, id: ObjectiveId) -> Result<ObjectiveProgress> {
        let inner = self.inner.lock();
        let objective = inner
            .objectives
            .get(&id)
            .ok_or(CoordinationError::ObjectiveNotFound(id))?;

        let mut progress = ObjectiveProgress {
            objective_id: id,
            status: objective.status,
            counts: Default::default(),
            total: 0,
            progress: 1.0,
        };
        let mut terminal = 0usize;
        for task in objective.task_ids.iter().filter_map(|t| inner.tasks.get(t)) {
            *progress.counts.entry(task.status).or_insert(0) += 1;
            progress.total += 1;
            if task.is_terminal() {
                terminal += 1;
            }
        }
        if progress.total > 0 {
            progress.progress = terminal as f64 / progress.total as f64;
        }
        Ok(progress)
    }

    /// Drop terminal tasks that finished at or before `older_than`.
    pub fn purge_terminal(&self, older_than: Time) -> Vec<TaskId> {
        let mut inner = self.inner.lock();
        let mut purged: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.is_terminal() && t.finished_at.unwrap_or(t.updated_at) <= older_than)
            .map(|t| t.id)
            .collect();
        purged.sort();

        for id in &purged {
            inner.remove_edges_of(*id);
            inner.tasks.remove(id);
        }
        let purged_set: HashSet<_> = purged.iter().copied().collect();
        inner.objectives.retain(|_, objective| {
            objective.task_ids.retain(|id| !purged_set.contains(id));
            !(objective.status.is_terminal() && objective.task_ids.is_empty())
        });

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged terminal tasks");
        }
        purged
    }

    /// A dependency cycle among unfinished tasks, if one exists.
    ///
    /// Edge insertion rejects cycles, so this only finds one in state that
    /// bypassed insertion, such as a hand-edited snapshot.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        self.inner.lock().find_cycle()
    }

    /// Replace the graph with persisted state.
    ///
    /// Tasks that were assigned, running or waiting out a backoff lost
    /// their execution with the process; they go back through readiness
    /// like pending tasks. Returns the tasks that were reset.
    pub fn restore(
        &self,
        tasks: Vec<Task>,
        edges: Vec<DependencyEdge>,
        objectives: Vec<Objective>,
        now: Time,
    ) -> Result<Vec<TaskId>> {
        let mut fresh = GraphInner::default();
        let mut reset = Vec::new();
        for mut task in tasks {
            let interrupted = task.status.is_in_flight()
                || (task.status == TaskStatus::Failed && task.retry_at.is_some());
            if interrupted {
                reset.push(task.id);
                task.assigned_agent_id = None;
                task.started_at = None;
                task.retry_at = None;
                task.transition(TaskStatus::Pending, now);
            } else if task.status == TaskStatus::Ready {
                // The frontier is derived, not persisted.
                task.status = TaskStatus::Pending;
            }
            task.dependencies.clear();
            fresh.tasks.insert(task.id, task);
        }
        for edge in edges {
            if !fresh.tasks.contains_key(&edge.from) {
                return Err(CoordinationError::TaskNotFound(edge.from));
            }
            let to = fresh
                .tasks
                .get_mut(&edge.to)
                .ok_or(CoordinationError::TaskNotFound(edge.to))?;
            to.dependencies.insert(edge.from);
            fresh.dependents.entry(edge.from).or_default().insert(edge.to);
        }
        if let Some(path) = fresh.find_cycle() {
            return Err(CoordinationError::DependencyCycle { path });
        }
        fresh.objectives = objectives.into_iter().map(|o| (o.id, o)).collect();

        let mut events = Vec::new();
        let mut ids: Vec<_> = fresh.tasks.keys().copied().collect();
        ids.sort();
        for id in ids {
            fresh.promote(id, now, &mut events);
        }
        reset.sort();

        {
            let mut inner = self.inner.lock();
            *inner = fresh;
            self.enqueue(events);
        }
        info!(reset = reset.len(), "Task graph restored");
        self.flush();
        Ok(reset)
    }
}

/// Longest backoff honoured; larger delays are clamped to it.
const MAX_RETRY_DELAY_DAYS: i64 = 365 * 100;

/// `now + delay`, with the delay clamped so the deadline stays representable.
fn retry_deadline(now: Time, delay: Duration) -> Time {
    let cap = chrono::Duration::days(MAX_RETRY_DELAY_DAYS);
    let delay = chrono::Duration::from_std(delay).map_or(cap, |d| d.min(cap));
    now.checked_add_signed(delay)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

fn validate_objective(spec: &ObjectiveSpec) -> Result<()> {
    if spec.tasks.is_empty() {
        return Err(CoordinationError::InvalidSpec(
            "objective has no tasks".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for task in &spec.tasks {
        if task.name.trim().is_empty() {
            return Err(CoordinationError::InvalidSpec(
                "task name must not be empty".to_string(),
            ));
        }
        if !names.insert(task.name.as_str()) {
            return Err(CoordinationError::InvalidSpec(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
    }
    for edge in &spec.edges {
        for end in [&edge.from, &edge.to] {
            if !names.contains(end.as_str()) {
                return Err(CoordinationError::InvalidSpec(format!(
                    "edge {} -> {} names unknown task '{}'",
                    edge.from, edge.to, end
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hivemind_core::EventKind;
    use std::sync::Arc;

    fn graph() -> TaskGraph {
        TaskGraph::new(EventBus::new(256)).with_defaults(3, 1_000)
    }

    fn status(graph: &TaskGraph, id: TaskId) -> TaskStatus {
        graph.get(id).unwrap().status
    }

    fn run_to_running(graph: &TaskGraph, id: TaskId, agent: AgentId) {
        let now = Utc::now();
        let version = graph.get(id).unwrap().version;
        graph.try_assign(id, version, agent, now).unwrap();
        graph.mark_running(id, agent, now).unwrap();
    }

    fn finish(graph: &TaskGraph, id: TaskId) {
        let agent = AgentId::new();
        run_to_running(graph, id, agent);
        graph
            .complete(id, agent, serde_json::json!(null), 1, Utc::now())
            .unwrap();
    }

    fn no_backoff(_: u32) -> Duration {
        Duration::from_millis(10)
    }

    #[test]
    fn test_join_becomes_ready_after_both_parents() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[], now).unwrap();
        let c = graph.add_task(TaskSpec::new("c"), &[a, b], now).unwrap();

        assert_eq!(status(&graph, a), TaskStatus::Ready);
        assert_eq!(status(&graph, c), TaskStatus::Pending);

        finish(&graph, a);
        assert_eq!(status(&graph, c), TaskStatus::Pending);

        finish(&graph, b);
        assert_eq!(status(&graph, c), TaskStatus::Ready);
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        let c = graph.add_task(TaskSpec::new("c"), &[b], now).unwrap();
        let before = graph.edges();

        let err = graph.add_dependency(c, a, now).unwrap_err();
        match err {
            CoordinationError::DependencyCycle { path } => {
                assert_eq!(path, vec![c, a, b, c]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(graph.edges(), before);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_self_edge_rejected() {
        let graph = graph();
        let a = graph.add_task(TaskSpec::new("a"), &[], Utc::now()).unwrap();
        assert!(matches!(
            graph.add_dependency(a, a, Utc::now()),
            Err(CoordinationError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_objective_with_cycle_rolls_back() {
        let graph = graph();
        let spec = ObjectiveSpec::new("loop")
            .task(TaskSpec::new("x"))
            .task(TaskSpec::new("y"))
            .edge("x", "y")
            .edge("y", "x");

        assert!(matches!(
            graph.submit_objective(spec, Utc::now()),
            Err(CoordinationError::DependencyCycle { .. })
        ));
        assert!(graph.is_empty());
        assert!(graph.edges().is_empty());
        assert!(graph.objectives().is_empty());
    }

    #[test]
    fn test_objective_rejects_unknown_edge_and_duplicates() {
        let graph = graph();
        let unknown = ObjectiveSpec::new("o")
            .task(TaskSpec::new("x"))
            .edge("x", "missing");
        assert!(matches!(
            graph.submit_objective(unknown, Utc::now()),
            Err(CoordinationError::InvalidSpec(_))
        ));

        let duplicate = ObjectiveSpec::new("o")
            .task(TaskSpec::new("x"))
            .task(TaskSpec::new("x"));
        assert!(matches!(
            graph.submit_objective(duplicate, Utc::now()),
            Err(CoordinationError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_add_dependency_demotes_ready_task() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[], now).unwrap();
        assert_eq!(status(&graph, b), TaskStatus::Ready);

        graph.add_dependency(a, b, now).unwrap();
        assert_eq!(status(&graph, b), TaskStatus::Pending);
        assert_eq!(graph.dependents(a), vec![b]);
    }

    #[test]
    fn test_assignment_is_compare_and_swap() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let version = graph.get(a).unwrap().version;

        let first = AgentId::new();
        let second = AgentId::new();
        graph.try_assign(a, version, first, now).unwrap();
        let err = graph.try_assign(a, version, second, now).unwrap_err();
        assert_eq!(err, CoordinationError::AssignmentConflict { task_id: a });
        assert_eq!(graph.get(a).unwrap().assigned_agent_id, Some(first));
    }

    #[test]
    fn test_late_result_from_other_agent_rejected() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let agent = AgentId::new();
        run_to_running(&graph, a, agent);

        let stranger = AgentId::new();
        assert!(graph
            .complete(a, stranger, serde_json::json!(1), 1, now)
            .is_err());
        assert_eq!(status(&graph, a), TaskStatus::Running);
    }

    #[test]
    fn test_failure_retries_then_cancels_dependents() {
        let graph = graph();
        let now = Utc::now();
        let a = graph
            .add_task(TaskSpec::new("a").with_max_attempts(3), &[], now)
            .unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        let c = graph.add_task(TaskSpec::new("c"), &[b], now).unwrap();

        for attempt in 1..=2 {
            let agent = AgentId::new();
            run_to_running(&graph, a, agent);
            let outcome = graph
                .fail(a, Some(agent), format!("boom {attempt}"), now, no_backoff)
                .unwrap();
            assert_eq!(outcome.attempt, attempt);
            assert!(!outcome.terminal);
            assert_eq!(status(&graph, a), TaskStatus::Failed);
            assert!(graph.release_retry(a, now));
            assert_eq!(status(&graph, a), TaskStatus::Ready);
        }

        let agent = AgentId::new();
        run_to_running(&graph, a, agent);
        let outcome = graph
            .fail(a, Some(agent), "boom 3".to_string(), now, no_backoff)
            .unwrap();
        assert!(outcome.terminal);
        assert_eq!(outcome.retry_delay, None);
        assert_eq!(outcome.cancelled, vec![b, c]);

        let task = graph.get(a).unwrap();
        assert!(task.is_terminal());
        assert_eq!(
            task.last_error.as_deref(),
            Some("attempt 3/3: boom 3 <- attempt 2/3: boom 2 <- attempt 1/3: boom 1")
        );
        assert_eq!(status(&graph, c), TaskStatus::Cancelled);
        assert!(!graph.release_retry(a, now));
    }

    #[test]
    fn test_cancel_propagates_to_unstarted_dependents() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        let c = graph.add_task(TaskSpec::new("c"), &[b], now).unwrap();
        let agent = AgentId::new();
        run_to_running(&graph, a, agent);

        let outcome = graph.cancel(a, "user request", now).unwrap();
        assert_eq!(outcome.cancelled, vec![a, b, c]);
        assert_eq!(outcome.released, vec![(a, agent)]);
        assert_eq!(
            graph.get(b).unwrap().last_error.as_deref(),
            Some("upstream cancelled")
        );

        // Idempotent, and the late result is refused.
        assert_eq!(graph.cancel(a, "again", now).unwrap(), CancelOutcome::default());
        assert!(graph.complete(a, agent, serde_json::json!(1), 1, now).is_err());
    }

    #[test]
    fn test_cancel_completed_task_rejected() {
        let graph = graph();
        let a = graph.add_task(TaskSpec::new("a"), &[], Utc::now()).unwrap();
        finish(&graph, a);
        assert!(matches!(
            graph.cancel(a, "late", Utc::now()),
            Err(CoordinationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_reclaim_returns_task_without_consuming_attempt() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let agent = AgentId::new();
        run_to_running(&graph, a, agent);

        assert!(!graph.reclaim(a, AgentId::new(), now));
        assert!(graph.reclaim(a, agent, now));
        let task = graph.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.assigned_agent_id, None);
    }

    #[test]
    fn test_objective_completes_and_reports_progress() {
        let bus = EventBus::new(64);
        let mut stream = bus.stream();
        let graph = TaskGraph::new(bus);
        let spec = ObjectiveSpec::new("build")
            .task(TaskSpec::new("compile"))
            .task(TaskSpec::new("test"))
            .edge("compile", "test");
        let objective_id = graph.submit_objective(spec, Utc::now()).unwrap();
        let objective = graph.objective(objective_id).unwrap();

        let progress = graph.objective_progress(objective_id).unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.counts.get(&TaskStatus::Ready), Some(&1));
        assert_eq!(progress.progress, 0.0);

        finish(&graph, objective.task_ids[0]);
        finish(&graph, objective.task_ids[1]);

        let progress = graph.objective_progress(objective_id).unwrap();
        assert_eq!(progress.status, ObjectiveStatus::Completed);
        assert_eq!(progress.progress, 1.0);

        let mut kinds = Vec::new();
        while let Some(event) = stream.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds.first(), Some(&EventKind::ObjectiveSubmitted));
        assert_eq!(kinds.last(), Some(&EventKind::ObjectiveCompleted));
    }

    #[test]
    fn test_cancel_objective() {
        let graph = graph();
        let spec = ObjectiveSpec::new("o")
            .task(TaskSpec::new("x"))
            .task(TaskSpec::new("y"))
            .edge("x", "y");
        let id = graph.submit_objective(spec, Utc::now()).unwrap();
        let outcome = graph.cancel_objective(id, Utc::now()).unwrap();
        assert_eq!(outcome.cancelled.len(), 2);
        assert_eq!(graph.objective(id).unwrap().status, ObjectiveStatus::Cancelled);
        assert!(graph.cancel_objective(id, Utc::now()).unwrap().cancelled.is_empty());
    }

    #[test]
    fn test_purge_terminal() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        finish(&graph, a);

        let purged = graph.purge_terminal(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(purged, vec![a]);
        assert!(graph.get(a).is_none());
        assert!(graph.get(b).unwrap().dependencies.is_empty());
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_restore_resets_in_flight_and_recomputes_frontier() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        run_to_running(&graph, a, AgentId::new());

        let tasks = graph.list(&TaskFilter::default());
        let edges = graph.edges();

        let restored = self::graph();
        let reset = restored.restore(tasks, edges, Vec::new(), now).unwrap();
        assert_eq!(reset, vec![a]);
        assert_eq!(status(&restored, a), TaskStatus::Ready);
        assert_eq!(status(&restored, b), TaskStatus::Pending);
        assert_eq!(restored.get(a).unwrap().assigned_agent_id, None);
    }

    #[test]
    fn test_restore_rejects_cyclic_edges() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        let tasks = graph.list(&TaskFilter::default());
        let edges = vec![
            DependencyEdge { from: a, to: b },
            DependencyEdge { from: b, to: a },
        ];

        let err = graph.restore(tasks, edges, Vec::new(), now).unwrap_err();
        assert!(matches!(err, CoordinationError::DependencyCycle { .. }));
        // The failed restore left the original graph in place.
        assert_eq!(graph.edges(), vec![DependencyEdge { from: a, to: b }]);
    }

    #[test]
    fn test_remove_task_cancels_pending_dependents() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        let c = graph.add_task(TaskSpec::new("c"), &[], now).unwrap();

        let outcome = graph.remove_task(a, now).unwrap();
        assert_eq!(outcome.cancelled, vec![a, b]);
        assert!(outcome.released.is_empty());
        assert!(graph.get(a).is_none());

        let dependent = graph.get(b).unwrap();
        assert_eq!(dependent.status, TaskStatus::Cancelled);
        assert_eq!(dependent.last_error.as_deref(), Some(UPSTREAM_CANCELLED));
        assert!(graph.edges().is_empty());
        assert_eq!(graph.find_cycle(), None);
        let ready: Vec<TaskId> = graph.ready_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![c]);
    }

    #[test]
    fn test_remove_in_flight_task_reports_released_slot() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let agent = AgentId::new();
        let version = graph.get(a).unwrap().version;
        graph.try_assign(a, version, agent, now).unwrap();

        let outcome = graph.remove_task(a, now).unwrap();
        assert_eq!(outcome.released, vec![(a, agent)]);
        assert!(graph.get(a).is_none());
        assert!(graph.list(&TaskFilter::default()).is_empty());
    }

    #[test]
    fn test_remove_completed_task_keeps_dependents_ready() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let b = graph.add_task(TaskSpec::new("b"), &[a], now).unwrap();
        finish(&graph, a);
        assert_eq!(status(&graph, b), TaskStatus::Ready);

        let outcome = graph.remove_task(a, now).unwrap();
        assert!(outcome.cancelled.is_empty());
        assert!(graph.get(a).is_none());
        assert_eq!(status(&graph, b), TaskStatus::Ready);
        assert!(graph.get(b).unwrap().dependencies.is_empty());
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_oversized_backoff_still_schedules_retry() {
        let graph = graph();
        let now = Utc::now();
        let a = graph.add_task(TaskSpec::new("a"), &[], now).unwrap();
        let agent = AgentId::new();
        run_to_running(&graph, a, agent);

        let outcome = graph
            .fail(a, Some(agent), "boom".into(), now, |_| Duration::MAX)
            .unwrap();
        assert!(!outcome.terminal);

        let task = graph.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.is_terminal());
        assert!(task.retry_at.unwrap() > now);
        assert!(graph.release_retry(a, now));
        assert_eq!(status(&graph, a), TaskStatus::Ready);
    }

    #[test]
    fn test_handler_reentering_graph_sees_events_in_order() {
        let bus = EventBus::new(64);
        let graph = Arc::new(TaskGraph::new(bus.clone()));
        let agent = AgentId::new();

        let weak = Arc::downgrade(&graph);
        let assign_on_ready = move |e: &CoordinationEvent| -> anyhow::Result<()> {
            let (Some(graph), Some(task_id)) = (weak.upgrade(), e.task_id()) else {
                return Ok(());
            };
            let version = graph.get(task_id).map(|t| t.version).unwrap_or_default();
            graph.try_assign(task_id, version, agent, Utc::now())?;
            Ok(())
        };
        let _subscription = bus.subscribe(EventKind::TaskReady, assign_on_ready);
        let mut stream = bus.stream();

        let a = graph.add_task(TaskSpec::new("a"), &[], Utc::now()).unwrap();
        assert_eq!(status(&graph, a), TaskStatus::Assigned);

        let mut kinds = Vec::new();
        while let Some(event) = stream.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec![EventKind::TaskReady, EventKind::TaskAssigned]);
    }

    #[test]
    fn test_concurrent_mutations_publish_per_task_order() {
        let bus = EventBus::new(2048);
        let mut stream = bus.stream();
        let graph = Arc::new(TaskGraph::new(bus));

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let graph = Arc::clone(&graph);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = graph
                            .add_task(TaskSpec::new(format!("t{w}-{i}")), &[], Utc::now())
                            .unwrap();
                        finish(&graph, id);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut seen: HashMap<TaskId, Vec<EventKind>> = HashMap::new();
        while let Some(event) = stream.try_recv() {
            if let Some(id) = event.task_id() {
                seen.entry(id).or_default().push(event.kind());
            }
        }
        assert_eq!(seen.len(), 100);
        let expected = vec![
            EventKind::TaskReady,
            EventKind::TaskAssigned,
            EventKind::TaskRunning,
            EventKind::TaskCompleted,
        ];
        for kinds in seen.values() {
            assert_eq!(kinds, &expected);
        }
    }
}
