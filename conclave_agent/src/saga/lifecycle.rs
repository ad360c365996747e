//! Agent lifecycle operations.
//!
//! Create, update and delete are each built as an [`AtomicOperation`] whose
//! compensations are captured up front, then handed to the [`SagaEngine`].
//! Every operation holds the exclusive side of the [`ExecutionGate`] and is
//! refused while any worker wave is running.

use crate::gate::ExecutionGate;
use crate::saga::collaborators::DefinitionFile;
use crate::saga::engine::{plan_deletion, SagaEngine, SagaError, SagaReport};
use crate::saga::registry::OperationStatus;
use crate::saga::step::{AtomicOperation, Compensation, OperationKind, StepAction};
use conclave_core::{
    AgentName, AgentRecord, AgentStatus, DeletionPlan, DependencyGraph, DependencyReport,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Request to create a new agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub record: AgentRecord,
    #[serde(default)]
    pub files: Vec<DefinitionFile>,
}

impl CreateAgentRequest {
    pub fn new(record: AgentRecord) -> Self {
        Self {
            record,
            files: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = DefinitionFile>) -> Self {
        self.files = files.into_iter().collect();
        self
    }
}

/// Partial update of an existing agent. Unset fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateAgentRequest {
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub dependencies: Option<Vec<AgentName>>,
    pub status: Option<AgentStatus>,
    pub config: Option<serde_json::Value>,
}

impl UpdateAgentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn dependencies<I, N>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<AgentName>,
    {
        self.dependencies = Some(dependencies.into_iter().map(Into::into).collect());
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    fn apply(&self, current: &AgentRecord) -> AgentRecord {
        let mut updated = current.clone();
        if let Some(display_name) = &self.display_name {
            updated.display_name = display_name.clone();
        }
        if let Some(role) = &self.role {
            updated.role = role.clone();
        }
        if let Some(dependencies) = &self.dependencies {
            updated.dependencies = dependencies.clone();
        }
        if let Some(status) = self.status {
            updated.status = status;
        }
        if let Some(config) = &self.config {
            updated.config = config.clone();
        }
        updated
    }
}

/// Entry point for agent lifecycle operations.
#[derive(Clone)]
pub struct LifecycleManager {
    engine: SagaEngine,
    gate: ExecutionGate,
}

impl LifecycleManager {
    pub fn new(engine: SagaEngine, gate: ExecutionGate) -> Self {
        Self { engine, gate }
    }

    pub fn engine(&self) -> &SagaEngine {
        &self.engine
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Creates an agent.
    ///
    /// Returns `Err` only when the operation could not start. Saga failures
    /// are reported through the returned [`SagaReport`].
    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<SagaReport, SagaError> {
        let _guard = self.gate.mutation().await?;
        info!(agent = %request.record.name, "creating agent");
        let operation = build_create(request);
        Ok(self.engine.execute(operation).await)
    }

    /// Updates an existing agent.
    pub async fn update_agent(
        &self,
        name: &AgentName,
        request: UpdateAgentRequest,
    ) -> Result<SagaReport, SagaError> {
        let _guard = self.gate.mutation().await?;
        let current = self
            .engine
            .store()
            .get(name)
            .await?
            .ok_or_else(|| SagaError::RecordNotFound(name.clone()))?;
        let prior_artifacts = self
            .engine
            .generator()
            .snapshot(name)
            .await
            .map_err(|e| SagaError::StepExecutionFailed {
                step: "snapshot_artifacts".to_string(),
                cause: format!("{:#}", e),
            })?;

        info!(agent = %name, "updating agent");
        let updated = request.apply(&current);
        let compensation = match prior_artifacts {
            Some(snapshot) => Compensation::RestoreArtifacts {
                snapshots: vec![snapshot],
            },
            None => Compensation::DeleteArtifacts {
                agent: name.clone(),
            },
        };

        let mut operation = AtomicOperation::new(OperationKind::UpdateAgent, name.clone());
        if updated.dependencies != current.dependencies {
            operation = operation.with_step(
                StepAction::ValidateDependencyChange {
                    agent: name.clone(),
                    dependencies: updated.dependencies.clone(),
                },
                Compensation::None,
            );
        }
        let operation = operation
            .with_step(
                StepAction::RegenerateDefinition {
                    record: updated.clone(),
                },
                compensation,
            )
            .with_step(
                StepAction::UpdateRecord { record: updated },
                Compensation::RestoreRecord {
                    record: current.clone(),
                },
            )
            .with_step(
                StepAction::PropagateModification {
                    agent: name.clone(),
                },
                Compensation::PropagateModification { previous: current },
            )
            .with_step(StepAction::RebuildPlan, Compensation::RebuildPlan);

        Ok(self.engine.execute(operation).await)
    }

    /// Deletes an agent, cascading to its dependents when `force` is set.
    pub async fn delete_agent(&self, name: &AgentName, force: bool) -> Result<SagaReport, SagaError> {
        let _guard = self.gate.mutation().await?;
        let snapshot = self.engine.store().snapshot().await?;
        let plan = plan_deletion(&snapshot, name, self.engine.limits())
            .ok_or_else(|| SagaError::RecordNotFound(name.clone()))?;

        // Everything the deletion could remove, captured before any step runs.
        let affected: Vec<AgentName> = if force || plan.can_delete_safely {
            plan.deletion_order.clone()
        } else {
            vec![name.clone()]
        };
        let mut records = Vec::new();
        let mut artifacts = Vec::new();
        for agent in affected.iter().rev() {
            if let Some(record) = snapshot.get(agent) {
                records.push(record.clone());
            }
            let saved = self
                .engine
                .generator()
                .snapshot(agent)
                .await
                .map_err(|e| SagaError::StepExecutionFailed {
                    step: "snapshot_artifacts".to_string(),
                    cause: format!("{:#}", e),
                })?;
            artifacts.extend(saved);
        }

        info!(agent = %name, force, affected = affected.len(), "deleting agent");
        let operation = AtomicOperation::new(OperationKind::DeleteAgent, name.clone())
            .with_step(
                StepAction::AnalyzeDeletionImpact {
                    agent: name.clone(),
                },
                Compensation::None,
            )
            .with_step(
                StepAction::ExecuteDeletion {
                    agent: name.clone(),
                    force,
                },
                Compensation::RestoreRecords {
                    records: records.clone(),
                },
            )
            .with_step(
                StepAction::DeleteArtifacts {
                    agents: affected.clone(),
                },
                Compensation::RestoreArtifacts {
                    snapshots: artifacts,
                },
            )
            .with_step(
                StepAction::PropagateRemoval { agents: affected },
                Compensation::PropagateAddition { records },
            )
            .with_step(StepAction::RebuildPlan, Compensation::RebuildPlan);

        Ok(self.engine.execute(operation).await)
    }

    /// Read-only deletion impact analysis.
    pub async fn analyze_deletion(&self, name: &AgentName) -> Result<DeletionPlan, SagaError> {
        let snapshot = self.engine.store().snapshot().await?;
        plan_deletion(&snapshot, name, self.engine.limits())
            .ok_or_else(|| SagaError::RecordNotFound(name.clone()))
    }

    /// Dependency statistics and validation for the current roster.
    pub async fn dependency_report(&self) -> Result<DependencyReport, SagaError> {
        let snapshot = self.engine.store().snapshot().await?;
        Ok(DependencyGraph::build_with_limits(&snapshot, self.engine.limits()).report())
    }

    /// Status of an in-flight operation.
    pub fn operation_status(&self, id: &Uuid) -> Option<OperationStatus> {
        self.engine.registry().get(id)
    }

    /// Every in-flight operation, oldest first.
    pub fn active_operations(&self) -> Vec<OperationStatus> {
        self.engine.registry().list()
    }
}

fn build_create(request: CreateAgentRequest) -> AtomicOperation {
    let CreateAgentRequest { record, files } = request;
    let name = record.name.clone();

    AtomicOperation::new(OperationKind::CreateAgent, name.clone())
        .with_step(
            StepAction::ValidateNewAgent {
                agent: name.clone(),
                dependencies: record.dependencies.clone(),
            },
            Compensation::None,
        )
        .with_step(
            StepAction::ValidateDefinitionFiles {
                agent: name.clone(),
                files,
            },
            Compensation::DiscardValidationArtifacts {
                agent: name.clone(),
            },
        )
        .with_step(
            StepAction::MaterializeDefinition {
                record: record.clone(),
            },
            Compensation::DeleteArtifacts {
                agent: name.clone(),
            },
        )
        .with_step(
            StepAction::CreateRecord { record },
            Compensation::DeleteRecord {
                agent: name.clone(),
            },
        )
        .with_step(
            StepAction::PropagateAddition {
                agent: name.clone(),
            },
            Compensation::PropagateRemoval {
                agents: vec![name.clone()],
            },
        )
        .with_step(
            StepAction::RebuildPlan,
            Compensation::RebuildPlanExcluding { agent: name },
        )
}
