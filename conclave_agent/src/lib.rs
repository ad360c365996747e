//! ConclaveKit agent layer - lifecycle and scheduling of interdependent agents.
//!
//! This crate builds on [`conclave_core`]:
//!
//! - Saga: atomic create, update and delete of agents with compensation
//! - Workflow: iterative, dependency-ordered execution until stability
//! - Gate: keeps lifecycle mutations out of running waves
//! - Audit: append-only record of operations and iterations
//! - Builder: wires both halves to one plan cache, gate and audit log
//!
//! # Status
//!
//! Agent executors and coordinators are supplied by the caller. The crate
//! ships a stability-only coordinator and in-memory collaborators.

pub mod audit;
pub mod builder;
pub mod cancellation;
pub mod config;
pub mod gate;
pub mod saga;
pub mod workflow;

pub use audit::{AuditEvent, AuditLog};
pub use builder::{Conclave, ConclaveBuilder};
pub use cancellation::{StopSource, StopToken};
pub use config::{ConclaveConfig, ConfigError, SchedulerConfig};
pub use gate::{ExecutionGate, ExecutionInProgress};
pub use saga::{LifecycleManager, SagaEngine, SagaError, SagaReport};
pub use workflow::{ExecutionManager, RunState, Scheduler, WorkflowError, WorkflowStatus};
