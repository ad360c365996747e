//! In-memory registry of in-flight lifecycle operations.
//!
//! Status lookups take a short read lock and never wait on a running
//! operation. Entries are dropped once their operation is terminal.

use crate::saga::step::{AtomicOperation, OperationKind, StepOutcome, Subsystem};
use chrono::{DateTime, Utc};
use conclave_core::AgentName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Per-step entry of a status report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub name: String,
    pub subsystem: Subsystem,
    pub completed: bool,
    pub error: Option<String>,
    pub result: Option<StepOutcome>,
}

/// Point-in-time status of a lifecycle operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub target: AgentName,
    pub created_at: DateTime<Utc>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_step: Option<String>,
    pub steps: Vec<StepStatus>,
}

impl From<&AtomicOperation> for OperationStatus {
    fn from(op: &AtomicOperation) -> Self {
        Self {
            operation_id: op.id,
            kind: op.kind,
            target: op.target.clone(),
            created_at: op.created_at,
            total_steps: op.steps.len(),
            completed_steps: op.completed_steps(),
            failed_step: op
                .failed_step
                .and_then(|i| op.steps.get(i))
                .map(|s| s.name.clone()),
            steps: op
                .steps
                .iter()
                .map(|s| StepStatus {
                    name: s.name.clone(),
                    subsystem: s.subsystem,
                    completed: s.completed,
                    error: s.error.clone(),
                    result: s.result.clone(),
                })
                .collect(),
        }
    }
}

/// Shared registry keyed by operation id.
#[derive(Clone, Debug, Default)]
pub struct OperationRegistry {
    operations: Arc<RwLock<HashMap<Uuid, OperationStatus>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the current status of an operation.
    pub fn publish(&self, op: &AtomicOperation) {
        let status = OperationStatus::from(op);
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations.insert(op.id, status);
    }

    /// Drops a terminal operation.
    pub fn remove(&self, id: &Uuid) {
        let mut operations = self.operations.write().unwrap_or_else(|e| e.into_inner());
        operations.remove(id);
    }

    /// Returns the status of an in-flight operation.
    pub fn get(&self, id: &Uuid) -> Option<OperationStatus> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        operations.get(id).cloned()
    }

    /// Returns every in-flight operation, oldest first.
    pub fn list(&self) -> Vec<OperationStatus> {
        let operations = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<OperationStatus> = operations.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.operations.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
