//! Audit trail with serde-serializable events and JSON persistence.
//!
//! Lifecycle operations and workflow executions record their transitions
//! here. A log is shared by cloning; every clone appends to the same event
//! list.
//!
//! # Persistence
//!
//! When created with a directory, the full event list is rewritten to
//! `{dir}/{log_id}.json` after each recorded event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Error types for audit operations.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Failed to serialize audit events
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Failed to write audit file
    #[error("Write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to create audit directory
    #[error("Directory creation failed: {0}")]
    DirectoryFailed(String),
}

/// Audit event for lifecycle and workflow transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Lifecycle operation began
    OperationStarted {
        timestamp: DateTime<Utc>,
        operation_id: String,
        kind: String,
        step_count: usize,
    },
    /// Lifecycle step completed
    OperationStepCompleted {
        timestamp: DateTime<Utc>,
        operation_id: String,
        step: String,
    },
    /// Lifecycle step failed
    OperationStepFailed {
        timestamp: DateTime<Utc>,
        operation_id: String,
        step: String,
        error: String,
    },
    /// Compensation ran for a completed step
    OperationStepCompensated {
        timestamp: DateTime<Utc>,
        operation_id: String,
        step: String,
        outcome: String,
    },
    /// Lifecycle operation reached a terminal state
    OperationFinished {
        timestamp: DateTime<Utc>,
        operation_id: String,
        success: bool,
        rollback_completed: Option<bool>,
    },
    /// Workflow execution started or resumed
    WorkflowStarted {
        timestamp: DateTime<Utc>,
        thread_id: String,
        iteration: u64,
        agent_count: usize,
    },
    /// Worker round and coordinator step of one iteration finished
    IterationCompleted {
        timestamp: DateTime<Utc>,
        thread_id: String,
        iteration: u64,
        executed: Vec<String>,
        changed: Vec<String>,
        errors: usize,
    },
    /// Agent executor returned an error
    AgentFailed {
        timestamp: DateTime<Utc>,
        thread_id: String,
        iteration: u64,
        agent: String,
        error: String,
    },
    /// Workflow execution reached a terminal state
    WorkflowTerminated {
        timestamp: DateTime<Utc>,
        thread_id: String,
        status: String,
        reason: String,
    },
}

/// Shared audit log.
#[derive(Clone, Debug)]
pub struct AuditLog {
    log_id: Uuid,
    events: Arc<Mutex<Vec<AuditEvent>>>,
    audit_dir: Option<PathBuf>,
}

impl AuditLog {
    /// Creates an in-memory audit log.
    pub fn new() -> Self {
        Self {
            log_id: Uuid::new_v4(),
            events: Arc::new(Mutex::new(Vec::new())),
            audit_dir: None,
        }
    }

    /// Creates an audit log persisted under `audit_dir`.
    pub fn with_dir(audit_dir: PathBuf) -> Self {
        Self {
            audit_dir: Some(audit_dir),
            ..Self::new()
        }
    }

    /// Records an event and persists the log if a directory is configured.
    pub async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.lock().await;
        events.push(event);
        if let Some(dir) = &self.audit_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AuditError::DirectoryFailed(e.to_string()))?;
            let json = serde_json::to_string_pretty(&*events)?;
            tokio::fs::write(self.path_in(dir), json).await?;
        }
        Ok(())
    }

    /// Records an event, logging instead of failing on persistence errors.
    pub async fn record_or_warn(&self, event: AuditEvent) {
        if let Err(e) = self.record(event).await {
            tracing::warn!(log_id = %self.log_id, error = %e, "failed to persist audit event");
        }
    }

    /// Returns a copy of every recorded event.
    pub async fn replay(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub fn log_id(&self) -> Uuid {
        self.log_id
    }

    /// Path of the persisted log, if persistence is enabled.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.audit_dir.as_ref().map(|dir| self.path_in(dir))
    }

    fn path_in(&self, dir: &std::path::Path) -> PathBuf {
        dir.join(format!("{}.json", self.log_id))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finished(id: &str) -> AuditEvent {
        AuditEvent::OperationFinished {
            timestamp: Utc::now(),
            operation_id: id.to_string(),
            success: true,
            rollback_completed: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_replay() {
        let log = AuditLog::new();
        log.record(finished("op-1")).await.unwrap();

        let events = log.replay().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AuditEvent::OperationFinished { .. }));
        assert!(log.file_path().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_events() {
        let log = AuditLog::new();
        let clone = log.clone();
        clone.record(finished("op-1")).await.unwrap();
        assert_eq!(log.replay().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let log = AuditLog::with_dir(temp_dir.path().join("audit"));

        log.record(AuditEvent::WorkflowTerminated {
            timestamp: Utc::now(),
            thread_id: "thread-1".to_string(),
            status: "completed".to_string(),
            reason: "iteration cap".to_string(),
        })
        .await
        .unwrap();

        let path = log.file_path().unwrap();
        let content = tokio::fs::read_to_string(path).await.unwrap();
        let events: Vec<AuditEvent> = serde_json::from_str(&content).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            AuditEvent::WorkflowTerminated { thread_id, .. } => assert_eq!(thread_id, "thread-1"),
            other => panic!("Wrong event type: {:?}", other),
        }
    }
}
