//! Saga-based agent lifecycle.
//!
//! Creating, updating or deleting an agent touches several subsystems:
//! the dependency graph, the definition generator, the agent store, the
//! instruction propagator and the plan cache. Each operation runs as an
//! [`AtomicOperation`] whose steps either all complete or are compensated
//! in reverse order.
//!
//! # Example
//!
//! ```rust,no_run
//! use conclave_agent::gate::ExecutionGate;
//! use conclave_agent::saga::{
//!     CreateAgentRequest, InMemoryDefinitionGenerator, LifecycleManager, RosterPropagator,
//!     SagaEngine,
//! };
//! use conclave_core::{AgentRecord, InMemoryAgentStore, PlanCache};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SagaEngine::new(
//!     Arc::new(InMemoryAgentStore::new()),
//!     Arc::new(InMemoryDefinitionGenerator::new()),
//!     Arc::new(RosterPropagator::new()),
//!     PlanCache::new(),
//! );
//! let manager = LifecycleManager::new(engine, ExecutionGate::new());
//!
//! let report = manager
//!     .create_agent(CreateAgentRequest::new(AgentRecord::new("researcher")))
//!     .await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod engine;
pub mod lifecycle;
pub mod registry;
pub mod step;

pub use collaborators::{
    ArtifactSnapshot, DefinitionFile, DefinitionGenerator, InMemoryDefinitionGenerator,
    InstructionPropagator, RosterPropagator,
};
pub use engine::{
    plan_deletion, RollbackOutcome, RollbackRecord, SagaEngine, SagaError, SagaReport, StepError,
};
pub use lifecycle::{CreateAgentRequest, LifecycleManager, UpdateAgentRequest};
pub use registry::{OperationRegistry, OperationStatus, StepStatus};
pub use step::{
    AtomicOperation, Compensation, OperationKind, OperationStep, StepAction, StepOutcome,
    Subsystem,
};
