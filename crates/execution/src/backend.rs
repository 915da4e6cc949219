//! Execution backend seam.
//!
//! The coordinator never does a task's work itself; it hands the task to
//! an [`ExecutionBackend`] once the task is running and waits up to the
//! task's timeout for an [`ExecutionOutcome`].

use async_trait::async_trait;
use hivemind_core::{Agent, Task, TaskId};
use serde::{Deserialize, Serialize};

/// How badly an attempt failed; drives the agent health penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// Ordinary reported failure
    #[default]
    Minor,
    /// Failure the agent should have avoided
    Moderate,
    /// Failure suggesting the agent is unreliable
    Major,
    /// Crash or timeout
    Critical,
}

impl FailureSeverity {
    /// Health subtracted from the agent.
    pub fn penalty(self) -> f64 {
        match self {
            Self::Minor => 0.01,
            Self::Moderate => 0.05,
            Self::Major => 0.1,
            Self::Critical => 0.2,
        }
    }
}

/// What a backend reports for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Whether the attempt succeeded
    pub success: bool,
    /// Output on success
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error message on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Severity on failure; minor when unset
    #[serde(default)]
    pub severity: Option<FailureSeverity>,
}

impl ExecutionOutcome {
    /// A successful attempt.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            severity: None,
        }
    }

    /// A failed attempt.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            severity: None,
        }
    }

    /// Set the failure severity.
    pub fn with_severity(mut self, severity: FailureSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// The failure message, or a generic one.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "backend reported failure".to_string())
    }
}

/// Does the actual work of a task.
///
/// Returning `Err` means the backend itself broke (crash, lost process)
/// and is treated as a critical failure; a task that merely failed should
/// come back as `Ok(ExecutionOutcome::failure(..))`.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run one attempt of `task` on `agent`.
    async fn execute(&self, task: &Task, agent: &Agent) -> anyhow::Result<ExecutionOutcome>;

    /// Best-effort request to stop an attempt that is no longer wanted.
    async fn abort(&self, task_id: TaskId) {
        let _ = task_id;
    }
}
