//! Assembles a lifecycle manager and an execution manager over shared state.
//!
//! Both halves must see the same plan cache, execution gate and audit log:
//! a saga that rebuilds the plan hands the new version to the scheduler,
//! and a running wave keeps sagas out through the gate.
//!
//! ```ignore
//! let config = ConclaveConfig::from_file(Path::new("conclave.yaml")).await?;
//! let conclave = ConclaveBuilder::new(config)
//!     .store(Arc::new(InMemoryAgentStore::new()))
//!     .executors(executors)
//!     .build()?;
//!
//! conclave.lifecycle().create_agent(request).await?;
//! let thread_id = conclave.executions().start("objective", None).await?;
//! ```

use crate::audit::AuditLog;
use crate::config::{ConclaveConfig, ConfigError};
use crate::gate::ExecutionGate;
use crate::saga::{
    DefinitionGenerator, InMemoryDefinitionGenerator, InstructionPropagator, LifecycleManager,
    RosterPropagator, SagaEngine,
};
use crate::workflow::{
    CheckpointStore, Coordinator, ExecutionManager, ExecutorRegistry, InMemoryCheckpointStore,
    Scheduler,
};
use conclave_core::{AgentStore, InMemoryAgentStore, PlanCache};
use std::sync::Arc;

/// Builder for a [`Conclave`].
///
/// Every collaborator defaults to its in-memory implementation.
pub struct ConclaveBuilder {
    config: ConclaveConfig,
    store: Option<Arc<dyn AgentStore>>,
    generator: Option<Arc<dyn DefinitionGenerator>>,
    propagator: Option<Arc<dyn InstructionPropagator>>,
    executors: ExecutorRegistry,
    coordinator: Option<Arc<dyn Coordinator>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl ConclaveBuilder {
    pub fn new(config: ConclaveConfig) -> Self {
        Self {
            config,
            store: None,
            generator: None,
            propagator: None,
            executors: ExecutorRegistry::new(),
            coordinator: None,
            checkpoints: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn DefinitionGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn propagator(mut self, propagator: Arc<dyn InstructionPropagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Validates the configuration and wires everything together.
    pub fn build(self) -> Result<Conclave, ConfigError> {
        self.config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryAgentStore::new()));
        let plans = self.config.plan_cache();
        let audit = self.config.audit_log();
        let gate = ExecutionGate::new();

        let engine = SagaEngine::new(
            Arc::clone(&store),
            self.generator
                .unwrap_or_else(|| Arc::new(InMemoryDefinitionGenerator::new())),
            self.propagator
                .unwrap_or_else(|| Arc::new(RosterPropagator::new())),
            plans.clone(),
        )
        .with_limits(self.config.graph)
        .with_audit_log(audit.clone());

        let mut scheduler = Scheduler::new(
            store,
            plans.clone(),
            self.executors,
            self.checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
        )
        .with_config(self.config.scheduler.clone())
        .with_gate(gate.clone())
        .with_audit_log(audit.clone());
        if let Some(coordinator) = self.coordinator {
            scheduler = scheduler.with_coordinator(coordinator);
        }

        tracing::debug!(
            audit_dir = ?self.config.audit_dir,
            max_iterations = self.config.scheduler.max_iterations,
            "conclave assembled"
        );
        Ok(Conclave {
            lifecycle: LifecycleManager::new(engine, gate),
            executions: ExecutionManager::new(scheduler),
            plans,
            audit,
            config: self.config,
        })
    }
}

/// Lifecycle and execution managers sharing one plan cache, gate and audit log.
#[derive(Clone)]
pub struct Conclave {
    lifecycle: LifecycleManager,
    executions: ExecutionManager,
    plans: PlanCache,
    audit: AuditLog,
    config: ConclaveConfig,
}

impl Conclave {
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn executions(&self) -> &ExecutionManager {
        &self.executions
    }

    pub fn plans(&self) -> &PlanCache {
        &self.plans
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn config(&self) -> &ConclaveConfig {
        &self.config
    }
}
