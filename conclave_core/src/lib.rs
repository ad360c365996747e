//! ConclaveKit - Core layer for coordinating interdependent agents.
//!
//! This crate owns the data model shared by the lifecycle and scheduling
//! layers:
//!
//! - **Types**: agent identities, statuses and records
//! - **Graph**: the agent dependency graph, cycle detection and deletion plans
//! - **Plan**: version-stamped execution plans cached per agent set
//! - **Store**: the agent store collaborator interface
//!
//! # Quick Start
//!
//! ```rust
//! use conclave_core::{AgentRecord, AgentSnapshot, DependencyGraph};
//!
//! let snapshot = AgentSnapshot::new(0, vec![
//!     AgentRecord::new("market"),
//!     AgentRecord::new("analyst").with_dependencies(["market"]),
//! ]);
//!
//! let graph = DependencyGraph::build(&snapshot);
//! assert!(graph.detect_cycles().is_empty());
//! ```
//!
//! # Modules
//!
//! - [`types`]: Core types used across the SDK
//! - [`error`]: Error types for all operations
//! - [`graph`]: Dependency graph manager
//! - [`plan`]: Execution plan cache
//! - [`store`]: Agent store interface and in-memory implementation

pub mod error;
pub mod types;

pub mod graph;
pub mod plan;
pub mod store;

pub use error::{ConclaveError, GraphError, Result, StoreError};
pub use graph::{
    AgentNode, DeletionPlan, DependencyGraph, DependencyReport, DependencyStatistics,
    GraphLimits, GraphValidationReport, OrphanedReference,
};
pub use plan::{ExecutionPlan, PlanCache};
pub use store::{AgentStore, InMemoryAgentStore};
pub use types::{
    AgentName, AgentRecord, AgentSnapshot, AgentStatus, DefinitionArtifacts, COORDINATOR_AGENT,
};
