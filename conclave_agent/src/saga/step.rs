//! Saga steps and their statically declared compensations.
//!
//! Every step pairs a [`StepAction`] with a [`Compensation`] fixed when the
//! operation is built, before anything executes. Both are closed enums, so
//! the engine's dispatch is checked exhaustively at compile time.

use crate::saga::collaborators::{ArtifactSnapshot, DefinitionFile};
use chrono::{DateTime, Utc};
use conclave_core::{AgentName, AgentRecord, DefinitionArtifacts, DeletionPlan};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateAgent,
    UpdateAgent,
    DeleteAgent,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::CreateAgent => "create_agent",
            OperationKind::UpdateAgent => "update_agent",
            OperationKind::DeleteAgent => "delete_agent",
        };
        write!(f, "{}", s)
    }
}

/// Collaborating subsystem a step acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    DependencyGraph,
    DefinitionGenerator,
    AgentStore,
    InstructionPropagator,
    PlanCache,
}

/// Forward action of a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StepAction {
    /// Check that inserting a new agent keeps the graph acyclic
    ValidateNewAgent {
        agent: AgentName,
        dependencies: Vec<AgentName>,
    },
    /// Validate submitted definition files
    ValidateDefinitionFiles {
        agent: AgentName,
        files: Vec<DefinitionFile>,
    },
    /// Produce the agent's executable definition
    MaterializeDefinition { record: AgentRecord },
    /// Insert the record, attaching artifacts from the materialize step
    CreateRecord { record: AgentRecord },
    /// Regenerate every other agent's instructions for an addition
    PropagateAddition { agent: AgentName },
    /// Rebuild the cached execution plan
    RebuildPlan,
    /// Check that a dependency change keeps the graph acyclic
    ValidateDependencyChange {
        agent: AgentName,
        dependencies: Vec<AgentName>,
    },
    /// Regenerate the agent's executable definition
    RegenerateDefinition { record: AgentRecord },
    /// Replace the record, attaching artifacts from the regenerate step
    UpdateRecord { record: AgentRecord },
    /// Regenerate instructions for a modification
    PropagateModification { agent: AgentName },
    /// Read-only deletion impact analysis
    AnalyzeDeletionImpact { agent: AgentName },
    /// Remove the record, cascading in plan order when forced
    ExecuteDeletion { agent: AgentName, force: bool },
    /// Remove generated definitions of deleted agents
    DeleteArtifacts { agents: Vec<AgentName> },
    /// Regenerate instructions for removals
    PropagateRemoval { agents: Vec<AgentName> },
}

impl StepAction {
    /// Stable step name used in reports and logs.
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::ValidateNewAgent { .. } => "validate_dependencies",
            StepAction::ValidateDefinitionFiles { .. } => "validate_definition_files",
            StepAction::MaterializeDefinition { .. } => "materialize_definition",
            StepAction::CreateRecord { .. } => "create_record",
            StepAction::PropagateAddition { .. } => "propagate_addition",
            StepAction::RebuildPlan => "rebuild_plan",
            StepAction::ValidateDependencyChange { .. } => "validate_dependency_change",
            StepAction::RegenerateDefinition { .. } => "regenerate_definition",
            StepAction::UpdateRecord { .. } => "update_record",
            StepAction::PropagateModification { .. } => "propagate_modification",
            StepAction::AnalyzeDeletionImpact { .. } => "analyze_deletion_impact",
            StepAction::ExecuteDeletion { .. } => "execute_deletion",
            StepAction::DeleteArtifacts { .. } => "delete_artifacts",
            StepAction::PropagateRemoval { .. } => "propagate_removal",
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        match self {
            StepAction::ValidateNewAgent { .. }
            | StepAction::ValidateDependencyChange { .. }
            | StepAction::AnalyzeDeletionImpact { .. } => Subsystem::DependencyGraph,
            StepAction::ValidateDefinitionFiles { .. }
            | StepAction::MaterializeDefinition { .. }
            | StepAction::RegenerateDefinition { .. }
            | StepAction::DeleteArtifacts { .. } => Subsystem::DefinitionGenerator,
            StepAction::CreateRecord { .. }
            | StepAction::UpdateRecord { .. }
            | StepAction::ExecuteDeletion { .. } => Subsystem::AgentStore,
            StepAction::PropagateAddition { .. }
            | StepAction::PropagateModification { .. }
            | StepAction::PropagateRemoval { .. } => Subsystem::InstructionPropagator,
            StepAction::RebuildPlan => Subsystem::PlanCache,
        }
    }
}

/// Compensating action declared for a step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Compensation {
    /// Pure step, nothing to undo
    None,
    DiscardValidationArtifacts { agent: AgentName },
    DeleteArtifacts { agent: AgentName },
    DeleteRecord { agent: AgentName },
    /// Regenerate instructions as if `agents` were never added
    PropagateRemoval { agents: Vec<AgentName> },
    /// Regenerate instructions with `records` back on the roster
    PropagateAddition { records: Vec<AgentRecord> },
    /// Regenerate instructions with `previous` back in place
    PropagateModification { previous: AgentRecord },
    RebuildPlan,
    RebuildPlanExcluding { agent: AgentName },
    RestoreArtifacts { snapshots: Vec<ArtifactSnapshot> },
    RestoreRecord { record: AgentRecord },
    /// Re-insert records removed by a deletion, roots first
    RestoreRecords { records: Vec<AgentRecord> },
}

impl Compensation {
    pub fn name(&self) -> &'static str {
        match self {
            Compensation::None => "none",
            Compensation::DiscardValidationArtifacts { .. } => "discard_validation_artifacts",
            Compensation::DeleteArtifacts { .. } => "delete_artifacts",
            Compensation::DeleteRecord { .. } => "delete_record",
            Compensation::PropagateRemoval { .. } => "propagate_removal",
            Compensation::PropagateAddition { .. } => "propagate_addition",
            Compensation::PropagateModification { .. } => "propagate_modification",
            Compensation::RebuildPlan => "rebuild_plan",
            Compensation::RebuildPlanExcluding { .. } => "rebuild_plan_excluding",
            Compensation::RestoreArtifacts { .. } => "restore_artifacts",
            Compensation::RestoreRecord { .. } => "restore_record",
            Compensation::RestoreRecords { .. } => "restore_records",
        }
    }
}

/// Result produced by a completed step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Validated,
    Artifacts(DefinitionArtifacts),
    RecordCreated(AgentRecord),
    RecordUpdated { previous: AgentRecord },
    DeletionPlanned(DeletionPlan),
    Deleted(Vec<AgentName>),
    ArtifactsDeleted(Vec<AgentName>),
    Propagated { regenerated: usize },
    PlanRebuilt { version: u64 },
}

/// One step of an atomic operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationStep {
    pub name: String,
    pub subsystem: Subsystem,
    pub action: StepAction,
    pub compensation: Compensation,
    pub completed: bool,
    pub result: Option<StepOutcome>,
    pub error: Option<String>,
}

impl OperationStep {
    /// Creates a pending step with its compensation.
    pub fn new(action: StepAction, compensation: Compensation) -> Self {
        Self {
            name: action.name().to_string(),
            subsystem: action.subsystem(),
            action,
            compensation,
            completed: false,
            result: None,
            error: None,
        }
    }
}

/// Multi-step lifecycle operation executed as a saga.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Agent the operation was requested for
    pub target: AgentName,
    pub steps: Vec<OperationStep>,
    pub created_at: DateTime<Utc>,
    /// Index of the failed step, if any
    pub failed_step: Option<usize>,
}

impl AtomicOperation {
    pub fn new(kind: OperationKind, target: AgentName) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
            steps: Vec::new(),
            created_at: Utc::now(),
            failed_step: None,
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, action: StepAction, compensation: Compensation) -> Self {
        self.steps.push(OperationStep::new(action, compensation));
        self
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.completed).count()
    }

    /// Names of the steps in declaration order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Finds the most recent outcome of earlier steps matching `pick`.
pub(crate) fn latest_outcome<'a, T>(
    steps: &'a [OperationStep],
    pick: impl Fn(&'a StepOutcome) -> Option<T>,
) -> Option<T> {
    steps
        .iter()
        .rev()
        .filter_map(|s| s.result.as_ref())
        .find_map(pick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names_follow_actions() {
        let op = AtomicOperation::new(OperationKind::DeleteAgent, AgentName::new("a"))
            .with_step(
                StepAction::AnalyzeDeletionImpact {
                    agent: AgentName::new("a"),
                },
                Compensation::None,
            )
            .with_step(StepAction::RebuildPlan, Compensation::RebuildPlan);

        assert_eq!(op.step_names(), vec!["analyze_deletion_impact", "rebuild_plan"]);
        assert_eq!(op.steps[0].subsystem, Subsystem::DependencyGraph);
        assert_eq!(op.steps[1].subsystem, Subsystem::PlanCache);
        assert_eq!(op.completed_steps(), 0);
    }

    #[test]
    fn test_latest_outcome_prefers_most_recent() {
        let mut first = OperationStep::new(StepAction::RebuildPlan, Compensation::None);
        first.result = Some(StepOutcome::PlanRebuilt { version: 1 });
        let mut second = OperationStep::new(StepAction::RebuildPlan, Compensation::None);
        second.result = Some(StepOutcome::PlanRebuilt { version: 2 });

        let steps = vec![first, second];
        let version = latest_outcome(&steps, |o| match o {
            StepOutcome::PlanRebuilt { version } => Some(*version),
            _ => None,
        });
        assert_eq!(version, Some(2));
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::CreateAgent.to_string(), "create_agent");
    }
}
