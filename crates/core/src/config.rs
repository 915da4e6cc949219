//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the coordinator and its background sweeps.
///
/// All durations are milliseconds so the struct reads naturally from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Scheduling tick
    pub tick_interval_ms: u64,
    /// Heartbeat sweep interval
    pub heartbeat_interval_ms: u64,
    /// Silence after which an agent is declared failed
    pub heartbeat_timeout_ms: u64,
    /// Memory TTL sweep interval
    pub memory_sweep_interval_ms: u64,
    /// Periodic deadlock scan interval
    pub deadlock_scan_interval_ms: u64,
    /// How long a ready task may go without candidates before it counts as stalled
    pub deadlock_grace_ms: u64,
    /// Retry backoff base
    pub retry_base_delay_ms: u64,
    /// Retry backoff cap
    pub retry_max_delay_ms: u64,
    /// Timeout for tasks that do not set one
    pub default_task_timeout_ms: u64,
    /// Attempt budget for tasks that do not set one
    pub default_max_attempts: u32,
    /// Agents below this health are never selected
    pub min_health: f64,
    /// Agents at or above this workload are never selected
    pub max_workload: f64,
    /// Memory store shard count
    pub memory_partitions: usize,
    /// Shard count for the distributed topology
    pub topology_partitions: usize,
    /// Event stream buffer
    pub event_buffer: usize,
    /// Periodic snapshot interval; `None` disables snapshots
    pub snapshot_interval_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            memory_sweep_interval_ms: 60_000,
            deadlock_scan_interval_ms: 15_000,
            deadlock_grace_ms: 60_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            default_task_timeout_ms: 300_000,
            default_max_attempts: 3,
            min_health: 0.5,
            max_workload: 0.8,
            memory_partitions: 16,
            topology_partitions: 4,
            event_buffer: 1024,
            snapshot_interval_ms: None,
        }
    }
}

impl CoordinatorConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduling tick.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set heartbeat sweep interval and timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set retry backoff base and cap.
    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = base.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the deadlock grace window.
    pub fn with_deadlock_grace(mut self, grace: Duration) -> Self {
        self.deadlock_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the default task timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default attempt budget.
    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    /// Enable periodic snapshots.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Scheduling tick as a duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Heartbeat sweep interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Memory sweep interval as a duration.
    pub fn memory_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sweep_interval_ms)
    }

    /// Deadlock scan interval as a duration.
    pub fn deadlock_scan_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_scan_interval_ms)
    }

    /// Backoff before retry number `attempt` (1-based attempts already made).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let intervals = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("memory_sweep_interval_ms", self.memory_sweep_interval_ms),
            ("deadlock_scan_interval_ms", self.deadlock_scan_interval_ms),
            ("default_task_timeout_ms", self.default_task_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(format!("{name} must be greater than zero"));
            }
        }
        if self.snapshot_interval_ms == Some(0) {
            return Err("snapshot_interval_ms must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_health) {
            return Err(format!("min_health {} outside [0, 1]", self.min_health));
        }
        if !(0.0..=1.0).contains(&self.max_workload) {
            return Err(format!("max_workload {} outside [0, 1]", self.max_workload));
        }
        if self.default_max_attempts == 0 {
            return Err("default_max_attempts must be at least 1".to_string());
        }
        if self.memory_partitions == 0 || self.topology_partitions == 0 || self.event_buffer == 0 {
            return Err("partition counts and event buffer must be positive".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms is below retry_base_delay_ms".to_string());
        }
        Ok(())
    }
}
