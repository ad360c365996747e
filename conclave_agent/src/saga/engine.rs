//! Saga execution engine.
//!
//! Runs the steps of an [`AtomicOperation`] strictly in order. When a step
//! fails, every completed step is compensated in reverse completion order
//! using the compensation declared when the operation was built. A failed
//! compensation is logged and recorded but never stops the sweep. The store
//! transaction opened for the operation is rolled back last, as a safety
//! net independent of the step-level compensations.

use crate::audit::{AuditEvent, AuditLog};
use crate::gate::ExecutionInProgress;
use crate::saga::collaborators::{DefinitionGenerator, InstructionPropagator};
use crate::saga::registry::{OperationRegistry, OperationStatus, StepStatus};
use crate::saga::step::{
    latest_outcome, AtomicOperation, Compensation, OperationKind, OperationStep, StepAction,
    StepOutcome,
};
use chrono::Utc;
use conclave_core::{
    AgentName, AgentSnapshot, AgentStore, ConclaveError, DeletionPlan, DependencyGraph,
    GraphError, GraphLimits, PlanCache, StoreError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Failure of a single step or compensation.
#[derive(Error, Debug)]
pub enum StepError {
    /// Input rejected by a validation step
    #[error("{0}")]
    Validation(String),

    /// Dependency graph rejected the change
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// Agent store failure
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Execution plan could not be rebuilt
    #[error("{0}")]
    Plan(#[from] ConclaveError),

    /// Definition generator or instruction propagator failure
    #[error("{0:#}")]
    Collaborator(#[from] anyhow::Error),
}

/// Error surfaced to the caller of a lifecycle operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SagaError {
    /// A validation step rejected the request
    #[error("Validation failed at {step}: {reason}")]
    ValidationFailed { step: String, reason: String },

    /// The change would introduce a dependency cycle
    #[error("Circular dependency introduced by {agent}: {cycles:?}")]
    CircularDependency {
        agent: AgentName,
        cycles: Vec<Vec<AgentName>>,
    },

    /// The target agent does not exist
    #[error("Agent not found: {0}")]
    RecordNotFound(AgentName),

    /// An agent with this name already exists
    #[error("Agent already exists: {0}")]
    AgentAlreadyExists(AgentName),

    /// Agents are running; topology changes are refused
    #[error(transparent)]
    ExecutionInProgress(#[from] ExecutionInProgress),

    /// A step failed and every compensation succeeded
    #[error("Step {step} failed: {cause}")]
    StepExecutionFailed { step: String, cause: String },

    /// A step failed and at least one compensation failed too
    #[error(
        "Step {step} failed ({cause}) and {} compensation(s) failed; manual reconciliation required",
        .failed_compensations.len()
    )]
    RollbackPartiallyFailed {
        step: String,
        cause: String,
        /// (step name, error) for each failed compensation
        failed_compensations: Vec<(String, String)>,
    },

    /// The agent store could not be read before the operation started
    #[error("Store error: {0}")]
    Store(String),
}

impl SagaError {
    /// True if the store or collaborators may be left partially compensated.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, SagaError::RollbackPartiallyFailed { .. })
    }

    fn classify(step: &str, err: StepError) -> Self {
        match err {
            StepError::Validation(reason) => SagaError::ValidationFailed {
                step: step.to_string(),
                reason,
            },
            StepError::Graph(GraphError::CircularDependency { agent, cycles }) => {
                SagaError::CircularDependency { agent, cycles }
            }
            StepError::Store(StoreError::NotFound(name)) => SagaError::RecordNotFound(name),
            StepError::Store(StoreError::AlreadyExists(name)) => {
                SagaError::AgentAlreadyExists(name)
            }
            other => SagaError::StepExecutionFailed {
                step: step.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => SagaError::RecordNotFound(name),
            StoreError::AlreadyExists(name) => SagaError::AgentAlreadyExists(name),
            other => SagaError::Store(other.to_string()),
        }
    }
}

/// Result of one compensation attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackOutcome {
    Compensated,
    /// Pure step with nothing to undo
    Skipped,
    Failed(String),
}

/// One compensation attempt, in the order attempted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub step_index: usize,
    pub step: String,
    pub compensation: String,
    pub outcome: RollbackOutcome,
}

/// Final report of a lifecycle operation.
#[derive(Clone, Debug, PartialEq)]
pub struct SagaReport {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub target: AgentName,
    pub success: bool,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    /// `None` when no rollback was needed
    pub rollback_completed: Option<bool>,
    pub rollback: Vec<RollbackRecord>,
    pub steps: Vec<StepStatus>,
    pub error: Option<SagaError>,
}

impl SagaReport {
    fn from_operation(op: &AtomicOperation) -> Self {
        let status = OperationStatus::from(op);
        Self {
            operation_id: op.id,
            kind: op.kind,
            target: op.target.clone(),
            success: false,
            completed_steps: op
                .steps
                .iter()
                .filter(|s| s.completed)
                .map(|s| s.name.clone())
                .collect(),
            failed_step: status.failed_step,
            rollback_completed: None,
            rollback: Vec::new(),
            steps: status.steps,
            error: None,
        }
    }

    /// Outcome of the named step, if it completed.
    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.name == step)
            .and_then(|s| s.result.as_ref())
    }

    /// Indices of the steps compensated, in the order attempted.
    pub fn rollback_order(&self) -> Vec<usize> {
        self.rollback.iter().map(|r| r.step_index).collect()
    }

    /// Converts a failed report into its error.
    pub fn into_result(self) -> Result<SagaReport, SagaError> {
        if self.success {
            return Ok(self);
        }
        match self.error.clone() {
            Some(error) => Err(error),
            None => Err(SagaError::StepExecutionFailed {
                step: self.failed_step.clone().unwrap_or_default(),
                cause: "operation failed".to_string(),
            }),
        }
    }
}

/// Computes a deletion plan against a snapshot.
///
/// Agents excluded from the graph (errored or configuring) have no
/// dependents by construction and get a trivial plan. Returns `None` when
/// the agent is not in the snapshot at all.
pub fn plan_deletion(
    snapshot: &AgentSnapshot,
    agent: &AgentName,
    limits: GraphLimits,
) -> Option<DeletionPlan> {
    let record = snapshot.get(agent)?;
    let graph = DependencyGraph::build_with_limits(snapshot, limits);
    if graph.contains(agent) {
        return Some(graph.analyze_deletion_impact(agent));
    }
    Some(DeletionPlan {
        target: agent.clone(),
        can_delete_safely: true,
        dependent_agents: Vec::new(),
        cascade_deletion_required: false,
        deletion_order: vec![agent.clone()],
        warnings: vec![format!(
            "Agent {} has status {:?} and is excluded from the dependency graph",
            agent, record.status
        )],
    })
}

/// Executes atomic operations against the collaborating subsystems.
#[derive(Clone)]
pub struct SagaEngine {
    store: Arc<dyn AgentStore>,
    generator: Arc<dyn DefinitionGenerator>,
    propagator: Arc<dyn InstructionPropagator>,
    plans: PlanCache,
    registry: OperationRegistry,
    limits: GraphLimits,
    audit: Option<AuditLog>,
}

impl SagaEngine {
    pub fn new(
        store: Arc<dyn AgentStore>,
        generator: Arc<dyn DefinitionGenerator>,
        propagator: Arc<dyn InstructionPropagator>,
        plans: PlanCache,
    ) -> Self {
        Self {
            store,
            generator,
            propagator,
            plans,
            registry: OperationRegistry::new(),
            limits: GraphLimits::default(),
            audit: None,
        }
    }

    pub fn with_limits(mut self, limits: GraphLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }

    pub fn generator(&self) -> &Arc<dyn DefinitionGenerator> {
        &self.generator
    }

    pub fn plans(&self) -> &PlanCache {
        &self.plans
    }

    pub fn limits(&self) -> GraphLimits {
        self.limits
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record_or_warn(event).await;
        }
    }

    /// Executes an operation to completion or full rollback.
    pub async fn execute(&self, mut operation: AtomicOperation) -> SagaReport {
        let transaction = operation.id.to_string();
        info!(
            operation_id = %operation.id,
            kind = %operation.kind,
            target = %operation.target,
            steps = operation.steps.len(),
            "starting lifecycle operation"
        );
        self.registry.publish(&operation);
        self.audit(AuditEvent::OperationStarted {
            timestamp: Utc::now(),
            operation_id: transaction.clone(),
            kind: operation.kind.to_string(),
            step_count: operation.steps.len(),
        })
        .await;

        if let Err(e) = self.store.begin(&transaction).await {
            error!(operation_id = %operation.id, error = %e, "could not open store transaction");
            let mut report = SagaReport::from_operation(&operation);
            report.error = Some(SagaError::StepExecutionFailed {
                step: "begin_transaction".to_string(),
                cause: e.to_string(),
            });
            self.finish(&operation, &report).await;
            return report;
        }

        for index in 0..operation.steps.len() {
            let result = self
                .run_action(&operation.steps[index].action, &operation.steps[..index])
                .await;

            match result {
                Ok(outcome) => {
                    let step = &mut operation.steps[index];
                    step.completed = true;
                    step.result = Some(outcome);
                    debug!(operation_id = %operation.id, step = %step.name, "step completed");
                    let step_name = step.name.clone();
                    self.registry.publish(&operation);
                    self.audit(AuditEvent::OperationStepCompleted {
                        timestamp: Utc::now(),
                        operation_id: transaction.clone(),
                        step: step_name,
                    })
                    .await;
                }
                Err(err) => {
                    let cause = err.to_string();
                    operation.steps[index].error = Some(cause.clone());
                    operation.failed_step = Some(index);
                    warn!(
                        operation_id = %operation.id,
                        step = %operation.steps[index].name,
                        error = %cause,
                        "step failed, compensating completed steps"
                    );
                    self.registry.publish(&operation);
                    self.audit(AuditEvent::OperationStepFailed {
                        timestamp: Utc::now(),
                        operation_id: transaction.clone(),
                        step: operation.steps[index].name.clone(),
                        error: cause,
                    })
                    .await;
                    return self.compensate(operation, index, err, &transaction).await;
                }
            }
        }

        if let Err(e) = self.store.commit(&transaction).await {
            warn!(operation_id = %operation.id, error = %e, "store commit failed after all steps completed");
        }

        let mut report = SagaReport::from_operation(&operation);
        report.success = true;
        info!(operation_id = %operation.id, "lifecycle operation completed");
        self.finish(&operation, &report).await;
        report
    }

    async fn compensate(
        &self,
        operation: AtomicOperation,
        failed: usize,
        err: StepError,
        transaction: &str,
    ) -> SagaReport {
        let mut records = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();

        for index in (0..failed).rev() {
            let step = &operation.steps[index];
            if !step.completed {
                continue;
            }
            let outcome = match self.run_compensation(&step.compensation).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        operation_id = %operation.id,
                        step = %step.name,
                        compensation = step.compensation.name(),
                        error = %e,
                        "compensation failed, continuing rollback"
                    );
                    failures.push((step.name.clone(), e.to_string()));
                    RollbackOutcome::Failed(e.to_string())
                }
            };
            self.audit(AuditEvent::OperationStepCompensated {
                timestamp: Utc::now(),
                operation_id: transaction.to_string(),
                step: step.name.clone(),
                outcome: format!("{:?}", outcome),
            })
            .await;
            records.push(RollbackRecord {
                step_index: index,
                step: step.name.clone(),
                compensation: step.compensation.name().to_string(),
                outcome,
            });
        }

        if let Err(e) = self.store.rollback(transaction).await {
            error!(operation_id = %operation.id, error = %e, "store transaction rollback failed");
            failures.push(("store_transaction".to_string(), e.to_string()));
        }

        let step_name = operation.steps[failed].name.clone();
        let error = if failures.is_empty() {
            SagaError::classify(&step_name, err)
        } else {
            SagaError::RollbackPartiallyFailed {
                step: step_name,
                cause: err.to_string(),
                failed_compensations: failures.clone(),
            }
        };

        let mut report = SagaReport::from_operation(&operation);
        report.rollback_completed = Some(failures.is_empty());
        report.rollback = records;
        report.error = Some(error);
        self.finish(&operation, &report).await;
        report
    }

    async fn finish(&self, operation: &AtomicOperation, report: &SagaReport) {
        self.registry.remove(&operation.id);
        self.audit(AuditEvent::OperationFinished {
            timestamp: Utc::now(),
            operation_id: operation.id.to_string(),
            success: report.success,
            rollback_completed: report.rollback_completed,
        })
        .await;
    }

    async fn run_action(
        &self,
        action: &StepAction,
        prior: &[OperationStep],
    ) -> Result<StepOutcome, StepError> {
        match action {
            StepAction::ValidateNewAgent {
                agent,
                dependencies,
            } => {
                reject_coordinator_dependencies(agent, dependencies)?;
                let snapshot = self.store.snapshot().await?;
                if snapshot.get(agent).is_some() {
                    return Err(StoreError::AlreadyExists(agent.clone()).into());
                }
                DependencyGraph::build_with_limits(&snapshot, self.limits)
                    .validate_proposed_dependencies(agent, dependencies)?;
                Ok(StepOutcome::Validated)
            }
            StepAction::ValidateDefinitionFiles { agent, files } => {
                self.generator
                    .validate_files(agent, files)
                    .await
                    .map_err(|e| StepError::Validation(format!("{:#}", e)))?;
                Ok(StepOutcome::Validated)
            }
            StepAction::MaterializeDefinition { record } => Ok(StepOutcome::Artifacts(
                self.generator.materialize(record).await?,
            )),
            StepAction::CreateRecord { record } => {
                let mut record = record.clone();
                if let Some(artifacts) = produced_artifacts(prior) {
                    record.artifacts = Some(artifacts);
                }
                self.store.insert(record.clone()).await?;
                Ok(StepOutcome::RecordCreated(record))
            }
            StepAction::PropagateAddition { agent } => {
                let snapshot = self.store.snapshot().await?;
                let regenerated = self.propagator.on_addition(agent, &snapshot).await?;
                Ok(StepOutcome::Propagated { regenerated })
            }
            StepAction::RebuildPlan => {
                let snapshot = self.store.snapshot().await?;
                let plan = self.plans.rebuild(&snapshot).await?;
                Ok(StepOutcome::PlanRebuilt {
                    version: plan.version,
                })
            }
            StepAction::ValidateDependencyChange {
                agent,
                dependencies,
            } => {
                reject_coordinator_dependencies(agent, dependencies)?;
                let snapshot = self.store.snapshot().await?;
                DependencyGraph::build_with_limits(&snapshot, self.limits)
                    .validate_proposed_dependencies(agent, dependencies)?;
                Ok(StepOutcome::Validated)
            }
            StepAction::RegenerateDefinition { record } => Ok(StepOutcome::Artifacts(
                self.generator.regenerate(record).await?,
            )),
            StepAction::UpdateRecord { record } => {
                let mut record = record.clone();
                if let Some(artifacts) = produced_artifacts(prior) {
                    record.artifacts = Some(artifacts);
                }
                let previous = self.store.update(record).await?;
                Ok(StepOutcome::RecordUpdated { previous })
            }
            StepAction::PropagateModification { agent } => {
                let snapshot = self.store.snapshot().await?;
                let regenerated = self.propagator.on_modification(agent, &snapshot).await?;
                Ok(StepOutcome::Propagated { regenerated })
            }
            StepAction::AnalyzeDeletionImpact { agent } => {
                let snapshot = self.store.snapshot().await?;
                let plan = plan_deletion(&snapshot, agent, self.limits)
                    .ok_or_else(|| StoreError::NotFound(agent.clone()))?;
                Ok(StepOutcome::DeletionPlanned(plan))
            }
            StepAction::ExecuteDeletion { agent, force } => {
                let plan = match latest_outcome(prior, |o| match o {
                    StepOutcome::DeletionPlanned(plan) => Some(plan.clone()),
                    _ => None,
                }) {
                    Some(plan) => plan,
                    None => {
                        let snapshot = self.store.snapshot().await?;
                        plan_deletion(&snapshot, agent, self.limits)
                            .ok_or_else(|| StoreError::NotFound(agent.clone()))?
                    }
                };

                if !plan.can_delete_safely && !force {
                    let dependents: Vec<&str> =
                        plan.dependent_agents.iter().map(AgentName::as_str).collect();
                    return Err(StepError::Validation(format!(
                        "Cannot delete agent {}: has dependent agents [{}]",
                        agent,
                        dependents.join(", ")
                    )));
                }

                let mut deleted = Vec::new();
                for name in &plan.deletion_order {
                    match self.store.remove(name).await {
                        Ok(_) => deleted.push(name.clone()),
                        Err(StoreError::NotFound(_)) => {
                            debug!(agent = %name, "agent already removed");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(StepOutcome::Deleted(deleted))
            }
            StepAction::DeleteArtifacts { agents } => {
                let agents = deleted_agents(prior).unwrap_or_else(|| agents.clone());
                for agent in &agents {
                    self.generator.delete(agent).await?;
                }
                Ok(StepOutcome::ArtifactsDeleted(agents))
            }
            StepAction::PropagateRemoval { agents } => {
                let agents = deleted_agents(prior).unwrap_or_else(|| agents.clone());
                let snapshot = self.store.snapshot().await?;
                let regenerated = self.propagator.on_removal(&agents, &snapshot).await?;
                Ok(StepOutcome::Propagated { regenerated })
            }
        }
    }

    async fn run_compensation(
        &self,
        compensation: &Compensation,
    ) -> Result<RollbackOutcome, StepError> {
        match compensation {
            Compensation::None => return Ok(RollbackOutcome::Skipped),
            Compensation::DiscardValidationArtifacts { agent } => {
                self.generator.discard_validation(agent).await?;
            }
            Compensation::DeleteArtifacts { agent } => {
                self.generator.delete(agent).await?;
            }
            Compensation::DeleteRecord { agent } => match self.store.remove(agent).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            },
            Compensation::PropagateRemoval { agents } => {
                let mut roster = self.store.snapshot().await?;
                for agent in agents {
                    roster = roster.without(agent);
                }
                self.propagator.on_removal(agents, &roster).await?;
            }
            Compensation::PropagateAddition { records } => {
                let mut roster = self.store.snapshot().await?;
                for record in records {
                    roster = roster.with_record(record.clone());
                }
                for record in records {
                    self.propagator.on_addition(&record.name, &roster).await?;
                }
            }
            Compensation::PropagateModification { previous } => {
                let roster = self.store.snapshot().await?.with_record(previous.clone());
                self.propagator
                    .on_modification(&previous.name, &roster)
                    .await?;
            }
            Compensation::RebuildPlan => {
                let snapshot = self.store.snapshot().await?;
                self.plans.rebuild(&snapshot).await?;
            }
            Compensation::RebuildPlanExcluding { agent } => {
                let snapshot = self.store.snapshot().await?;
                self.plans.rebuild_excluding(&snapshot, agent).await?;
            }
            Compensation::RestoreArtifacts { snapshots } => {
                for snapshot in snapshots {
                    self.generator.restore(snapshot).await?;
                }
            }
            Compensation::RestoreRecord { record } => {
                match self.store.update(record.clone()).await {
                    Ok(_) => {}
                    Err(StoreError::NotFound(_)) => self.store.insert(record.clone()).await?,
                    Err(e) => return Err(e.into()),
                }
            }
            Compensation::RestoreRecords { records } => {
                for record in records {
                    if self.store.get(&record.name).await?.is_none() {
                        self.store.insert(record.clone()).await?;
                    }
                }
            }
        }
        Ok(RollbackOutcome::Compensated)
    }
}

fn reject_coordinator_dependencies(
    agent: &AgentName,
    dependencies: &[AgentName],
) -> Result<(), StepError> {
    if agent.is_coordinator() && !dependencies.is_empty() {
        return Err(StepError::Validation(
            "The coordinator agent cannot have dependencies".to_string(),
        ));
    }
    Ok(())
}

fn produced_artifacts(prior: &[OperationStep]) -> Option<conclave_core::DefinitionArtifacts> {
    latest_outcome(prior, |o| match o {
        StepOutcome::Artifacts(artifacts) => Some(artifacts.clone()),
        _ => None,
    })
}

fn deleted_agents(prior: &[OperationStep]) -> Option<Vec<AgentName>> {
    latest_outcome(prior, |o| match o {
        StepOutcome::Deleted(agents) => Some(agents.clone()),
        _ => None,
    })
}
