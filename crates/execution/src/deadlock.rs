//! Deadlock detection.
//!
//! Edge insertion already forbids dependency cycles, so a stall at run
//! time is a resource stall: ready tasks that no agent can take (for
//! example, a capability nobody exposes) while nothing else is in flight
//! to change that. Once such tasks have waited longer than the grace
//! window the lowest-priority one is picked as the victim.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use hivemind_core::{Task, TaskId, TaskStatus, Time};
use parking_lot::Mutex;

use crate::graph::TaskGraph;

/// A detected deadlock and the task chosen to break it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockReport {
    /// Task to force-cancel
    pub victim: TaskId,
    /// Every task involved, victim included
    pub stalled: Vec<TaskId>,
}

/// Tracks how long ready tasks have gone without an eligible agent.
pub struct DeadlockDetector {
    grace: chrono::Duration,
    stalled_since: Mutex<HashMap<TaskId, Time>>,
}

impl DeadlockDetector {
    /// Create a detector with the given grace window.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace: chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX),
            stalled_since: Mutex::new(HashMap::new()),
        }
    }

    /// Note that no agent could take `task_id`. Keeps the earliest time.
    pub fn observe_unassignable(&self, task_id: TaskId, now: Time) {
        self.stalled_since.lock().entry(task_id).or_insert(now);
    }

    /// The task found an agent or left the frontier.
    pub fn clear(&self, task_id: TaskId) {
        self.stalled_since.lock().remove(&task_id);
    }

    /// Whether some task has been unassignable past the grace window.
    pub fn has_overdue(&self, now: Time) -> bool {
        self.stalled_since
            .lock()
            .values()
            .any(|since| now - *since >= self.grace)
    }

    /// Tasks unassignable past the grace window, sorted.
    pub fn overdue(&self, now: Time) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .stalled_since
            .lock()
            .iter()
            .filter(|(_, since)| now - **since >= self.grace)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Look for a deadlock in `graph`.
    ///
    /// Returns `None` while any task is in flight or waiting to retry,
    /// since those can still free or add capacity. Tracked tasks for which
    /// `schedulable` now holds are forgotten before a victim is picked.
    pub fn scan(
        &self,
        graph: &TaskGraph,
        now: Time,
        schedulable: impl Fn(&Task) -> bool,
    ) -> Option<DeadlockReport> {
        if let Some(cycle) = graph.find_cycle() {
            let mut members: Vec<Task> = cycle.iter().filter_map(|id| graph.get(*id)).collect();
            members.sort_by_key(|t| t.id);
            members.dedup_by_key(|t| t.id);
            return report(members);
        }

        let tracked: Vec<TaskId> = self.stalled_since.lock().keys().copied().collect();
        for id in tracked {
            let still_stalled = graph
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Ready && !schedulable(&t));
            if !still_stalled {
                self.clear(id);
            }
        }

        let overdue = self.overdue(now);
        if overdue.is_empty() {
            return None;
        }
        if graph.in_flight_count() > 0 || graph.retry_pending_count() > 0 {
            return None;
        }

        let members: Vec<Task> = overdue.iter().filter_map(|id| graph.get(*id)).collect();
        let found = report(members)?;
        self.clear(found.victim);
        Some(found)
    }
}

/// Lowest priority loses; among equals the newest task goes first.
fn report(members: Vec<Task>) -> Option<DeadlockReport> {
    let victim = members
        .iter()
        .min_by_key(|t| (t.priority, Reverse(t.created_at), Reverse(t.id)))?
        .id;
    Some(DeadlockReport {
        victim,
        stalled: members.iter().map(|t| t.id).collect(),
    })
}
