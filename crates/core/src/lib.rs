//! hivemind core data models.
//!
//! This crate defines the entities the coordination engine works on
//! (agents, tasks, objectives, memory entries), the events it emits,
//! the event bus that carries them, and the shared error taxonomy.

#![warn(missing_docs)]

// Identities
mod id;

// Entities
mod agent;
mod task;
mod objective;
mod memory;
mod catalog;

// Notifications
mod event;
pub mod bus;

// Ambient
mod error;
mod config;

pub use id::*;
pub use agent::{Agent, AgentDescriptor, AgentStatus, HeartbeatMetrics};
pub use task::{DependencyEdge, Task, TaskFilter, TaskSpec, TaskStatus};
pub use objective::{
    EdgeSpec, Objective, ObjectiveProgress, ObjectiveSpec, ObjectiveStatus, TopologyStrategy,
};
pub use memory::{AccessLevel, Accessor, MemoryEntry};
pub use catalog::{AgentCatalog, AgentProfile};
pub use event::{CoordinationEvent, EventKind};
pub use bus::{EventBus, EventHandler, EventStream, Subscription};
pub use error::{CoordinationError, Result};
pub use config::CoordinatorConfig;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
