//! Execution backend that runs `payload.command` through `sh -c`.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use hivemind_core::{Agent, Task, TaskId};
use hivemind_execution::{ExecutionBackend, ExecutionOutcome, FailureSeverity};
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

/// Runs each task as a shell command on this machine.
///
/// The child is killed when its execution is dropped, which covers both
/// timeouts and cancellation.
#[derive(Debug, Clone, Default)]
pub struct ShellBackend {
    workdir: Option<PathBuf>,
}

impl ShellBackend {
    /// Run commands in the current directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands in `dir`.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ExecutionBackend for ShellBackend {
    async fn execute(&self, task: &Task, agent: &Agent) -> anyhow::Result<ExecutionOutcome> {
        let Some(command) = task.payload.get("command").and_then(|c| c.as_str()) else {
            return Ok(ExecutionOutcome::failure("payload has no \"command\" string")
                .with_severity(FailureSeverity::Major));
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("HIVEMIND_TASK_ID", task.id.to_string())
            .env("HIVEMIND_TASK_NAME", &task.name)
            .env("HIVEMIND_AGENT_ID", agent.id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        debug!(task_id = %task.id, agent = %agent.name, command, "Spawning shell");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn sh for task {}", task.name))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if output.status.success() {
            return Ok(ExecutionOutcome::success(json!({
                "stdout": stdout,
                "stderr": stderr,
            })));
        }

        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        let message = match stderr.lines().last() {
            Some(line) => format!("{status}: {line}"),
            None => status,
        };
        Ok(ExecutionOutcome::failure(message))
    }

    async fn abort(&self, task_id: TaskId) {
        debug!(task_id = %task_id, "Abort requested; child is killed with its execution");
    }
}
