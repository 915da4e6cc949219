//! Execution layer - dependency tracking, agent selection and the
//! coordinator loop that ties them together.

#![warn(missing_docs)]

pub mod graph;
pub mod registry;
pub mod selector;
pub mod topology;
pub mod backend;
pub mod deadlock;
pub mod coordinator;

pub use graph::{CancelOutcome, FailureOutcome, TaskGraph};
pub use registry::{AgentQuery, AgentRegistry, StaleAgent};
pub use selector::{AgentSelector, ScoredAgent};
pub use topology::Topology;
pub use backend::{ExecutionBackend, ExecutionOutcome, FailureSeverity};
pub use deadlock::{DeadlockDetector, DeadlockReport};
pub use coordinator::{Coordinator, TickReport};
