//! hivemind CLI - run objective files against local shell agents.

mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hivemind_core::{
    AgentDescriptor, CoordinatorConfig, EventBus, HeartbeatMetrics, ObjectiveId, ObjectiveSpec,
    ObjectiveStatus, TaskFilter, TaskStatus,
};
use hivemind_execution::{Coordinator, TaskGraph};
use hivemind_storage::JsonSnapshotStore;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::shell::ShellBackend;

#[derive(Parser)]
#[command(name = "hivemind")]
#[command(about = "Task and agent coordination engine", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an objective until every task is finished
    Run {
        /// Objective file (JSON)
        objective: PathBuf,
        /// Coordinator config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of local agents
        #[arg(long, default_value = "2")]
        agents: usize,
        /// Kind of the local agents
        #[arg(long, default_value = "specialist")]
        kind: String,
        /// Directory for snapshots; resumes from it when present
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Working directory for task commands
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Check an objective file without running it
    Validate {
        /// Objective file (JSON)
        objective: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            objective,
            config,
            agents,
            kind,
            snapshot,
            workdir,
        } => {
            let spec = read_objective(&objective).await?;
            let config = match config {
                Some(path) => read_config(&path).await?,
                None => CoordinatorConfig::default(),
            };
            let mut backend = ShellBackend::new();
            if let Some(dir) = workdir {
                backend = backend.with_workdir(dir);
            }
            run(spec, config, agents, &kind, snapshot, backend).await?;
        }
        Commands::Validate { objective } => {
            let spec = read_objective(&objective).await?;
            let (tasks, edges) = (spec.tasks.len(), spec.edges.len());
            let graph = TaskGraph::new(EventBus::new(16));
            if let Err(e) = graph.submit_objective(spec, Utc::now()) {
                bail!("{} is invalid: {}", objective.display(), e);
            }
            let ready: Vec<String> = graph.ready_tasks().into_iter().map(|t| t.name).collect();
            println!("{}: ok", objective.display());
            println!("  Tasks: {}", tasks);
            println!("  Edges: {}", edges);
            println!("  Ready first: {}", ready.join(", "));
        }
    }

    Ok(())
}

async fn run(
    spec: ObjectiveSpec,
    config: CoordinatorConfig,
    agents: usize,
    kind: &str,
    snapshot: Option<PathBuf>,
    backend: ShellBackend,
) -> Result<()> {
    if agents == 0 {
        bail!("at least one agent is required");
    }
    let heartbeat_every = config.heartbeat_interval();

    let mut coordinator = Coordinator::new(config, Arc::new(backend))?;
    if let Some(dir) = snapshot {
        let store = JsonSnapshotStore::new(&dir).await?;
        coordinator = coordinator.with_snapshot_store(Arc::new(store));
        if coordinator.load_snapshot().await? {
            info!(dir = %dir.display(), "Resumed from snapshot");
        }
    }
    let coordinator = Arc::new(coordinator);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    for i in 0..agents {
        let agent_id = coordinator.register_agent(AgentDescriptor::new(format!("local-{i}"), kind))?;
        let coordinator = Arc::clone(&coordinator);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = coordinator.heartbeat(agent_id, HeartbeatMetrics::alive(Utc::now())) {
                            warn!(agent_id = %agent_id, error = %e, "Heartbeat rejected");
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    let runner = tokio::spawn(Arc::clone(&coordinator).run(shutdown_tx.subscribe()));
    let objective_id = resume_or_submit(&coordinator, spec)?;

    let status = tokio::select! {
        status = coordinator.wait_for_objective(objective_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(objective_id = %objective_id, "Interrupted, cancelling objective");
            coordinator.cancel_objective(objective_id)?;
            coordinator.wait_for_objective(objective_id).await?
        }
    };

    // Receivers may already be gone if the loop ended on its own.
    let _ = shutdown_tx.send(());
    runner.await??;

    print_summary(&coordinator, objective_id)?;
    if status != ObjectiveStatus::Completed {
        bail!("objective {objective_id} ended {status:?}");
    }
    Ok(())
}

/// Pick up an unfinished objective with the same description from a
/// restored snapshot, or submit a fresh one.
fn resume_or_submit(coordinator: &Coordinator, spec: ObjectiveSpec) -> Result<ObjectiveId> {
    let existing = coordinator
        .graph()
        .objectives()
        .into_iter()
        .find(|o| o.description == spec.description && !o.status.is_terminal());
    match existing {
        Some(objective) => {
            info!(objective_id = %objective.id, "Resuming objective");
            Ok(objective.id)
        }
        None => Ok(coordinator.submit_objective(spec)?),
    }
}

fn print_summary(coordinator: &Coordinator, objective_id: ObjectiveId) -> Result<()> {
    let progress = coordinator.objective_status(objective_id)?;
    println!("Objective {} ({:?})", objective_id, progress.status);
    for status in TaskStatus::ALL {
        if let Some(count) = progress.counts.get(&status).filter(|c| **c > 0) {
            println!("  {}: {}", status, count);
        }
    }

    let tasks = coordinator.list_tasks(&TaskFilter {
        objective_id: Some(objective_id),
        ..Default::default()
    });
    for task in tasks {
        println!("  {} | {} | {}", task.id, task.status, task.name);
        if let Some(error) = &task.last_error {
            println!("      {}", error);
        }
    }
    Ok(())
}

async fn read_objective(path: &Path) -> Result<ObjectiveSpec> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

async fn read_config(path: &Path) -> Result<CoordinatorConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: CoordinatorConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    Ok(config)
}
