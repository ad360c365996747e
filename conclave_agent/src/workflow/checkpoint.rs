//! Run state checkpoints with integrity validation.
//!
//! A checkpoint is taken at the end of every iteration. It carries the full
//! [`RunState`], a SHA-256 checksum over its contents and a checksum of the
//! tracked agent set so a resume can detect roster drift.

use crate::workflow::state::RunState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_core::AgentName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Error types for checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored checksum does not match the contents
    #[error("Checkpoint corrupted: expected checksum {expected}, got {actual}")]
    Corrupted { expected: String, actual: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Snapshot of a run state after one iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub id: Uuid,
    pub thread_id: String,
    /// Iteration that had just finished when the checkpoint was taken
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    /// State to resume from
    pub state: RunState,
    pub checksum: String,
    pub agent_set_checksum: String,
}

#[derive(Serialize)]
struct CheckpointDataForHash<'a> {
    id: Uuid,
    thread_id: &'a str,
    iteration: u64,
    timestamp: DateTime<Utc>,
    state: &'a RunState,
    agent_set_checksum: &'a str,
}

impl RunCheckpoint {
    /// Captures `state` after `iteration` finished.
    pub fn capture(state: &RunState, iteration: u64) -> Result<Self, CheckpointError> {
        let mut checkpoint = Self {
            id: Uuid::new_v4(),
            thread_id: state.thread_id.clone(),
            iteration,
            timestamp: Utc::now(),
            state: state.clone(),
            checksum: String::new(),
            agent_set_checksum: agent_set_checksum(state.agents.keys()),
        };
        checkpoint.checksum = checkpoint.compute_checksum()?;
        Ok(checkpoint)
    }

    fn compute_checksum(&self) -> Result<String, CheckpointError> {
        let data = CheckpointDataForHash {
            id: self.id,
            thread_id: &self.thread_id,
            iteration: self.iteration,
            timestamp: self.timestamp,
            state: &self.state,
            agent_set_checksum: &self.agent_set_checksum,
        };
        let json = serde_json::to_vec(&data)?;
        Ok(format!("{:x}", Sha256::digest(&json)))
    }

    /// Verifies the stored checksums against the contents.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let expected = self.compute_checksum()?;
        if self.checksum != expected {
            return Err(CheckpointError::Corrupted {
                expected,
                actual: self.checksum.clone(),
            });
        }
        let agents = agent_set_checksum(self.state.agents.keys());
        if self.agent_set_checksum != agents {
            return Err(CheckpointError::Corrupted {
                expected: agents,
                actual: self.agent_set_checksum.clone(),
            });
        }
        Ok(())
    }

    /// True if `agents` differs from the agent set at checkpoint time.
    pub fn agent_set_changed<'a>(&self, agents: impl Iterator<Item = &'a AgentName>) -> bool {
        agent_set_checksum(agents) != self.agent_set_checksum
    }
}

/// SHA-256 over the sorted agent names.
fn agent_set_checksum<'a>(agents: impl Iterator<Item = &'a AgentName>) -> String {
    let mut names: Vec<&str> = agents.map(AgentName::as_str).collect();
    names.sort_unstable();
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Storage for run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), CheckpointError>;

    async fn load(
        &self,
        thread_id: &str,
        iteration: u64,
    ) -> Result<Option<RunCheckpoint>, CheckpointError>;

    /// Checkpoint with the highest iteration for a thread.
    async fn latest(&self, thread_id: &str) -> Result<Option<RunCheckpoint>, CheckpointError>;

    /// Iterations checkpointed for a thread, ascending.
    async fn list(&self, thread_id: &str) -> Result<Vec<u64>, CheckpointError>;

    /// Drops every checkpoint of a thread.
    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    threads: Arc<RwLock<HashMap<String, BTreeMap<u64, RunCheckpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().unwrap_or_else(|e| e.into_inner());
        threads
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .insert(checkpoint.iteration, checkpoint.clone());
        Ok(())
    }

    async fn load(
        &self,
        thread_id: &str,
        iteration: u64,
    ) -> Result<Option<RunCheckpoint>, CheckpointError> {
        let threads = self.threads.read().unwrap_or_else(|e| e.into_inner());
        Ok(threads
            .get(thread_id)
            .and_then(|t| t.get(&iteration))
            .cloned())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<RunCheckpoint>, CheckpointError> {
        let threads = self.threads.read().unwrap_or_else(|e| e.into_inner());
        Ok(threads
            .get(thread_id)
            .and_then(|t| t.values().next_back())
            .cloned())
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let threads = self.threads.read().unwrap_or_else(|e| e.into_inner());
        Ok(threads
            .get(thread_id)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().unwrap_or_else(|e| e.into_inner());
        threads.remove(thread_id);
        Ok(())
    }
}

/// Checkpoint store writing one JSON file per iteration.
///
/// Layout: `{root}/{thread_id}/{iteration:08}.json`.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn thread_dir(&self, thread_id: &str) -> Result<PathBuf, CheckpointError> {
        if thread_id.is_empty()
            || thread_id.contains(['/', '\\'])
            || thread_id == "."
            || thread_id == ".."
        {
            return Err(CheckpointError::Storage(format!(
                "invalid thread id: {:?}",
                thread_id
            )));
        }
        Ok(self.root.join(thread_id))
    }

    fn file_name(iteration: u64) -> String {
        format!("{:08}.json", iteration)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), CheckpointError> {
        let dir = self.thread_dir(&checkpoint.thread_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(dir.join(Self::file_name(checkpoint.iteration)), json).await?;
        Ok(())
    }

    async fn load(
        &self,
        thread_id: &str,
        iteration: u64,
    ) -> Result<Option<RunCheckpoint>, CheckpointError> {
        let path = self.thread_dir(thread_id)?.join(Self::file_name(iteration));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<RunCheckpoint>, CheckpointError> {
        match self.list(thread_id).await?.last() {
            Some(iteration) => self.load(thread_id, *iteration).await,
            None => Ok(None),
        }
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.thread_dir(thread_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut iterations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(iteration) = stem.parse::<u64>() {
                iterations.push(iteration);
            }
        }
        iterations.sort_unstable();
        Ok(iterations)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let dir = self.thread_dir(thread_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::workflow::executor::AgentOutput;
    use serde_json::json;
    use tempfile::TempDir;

    fn state(thread_id: &str) -> RunState {
        let mut state = RunState::new(thread_id, "objective", &SchedulerConfig::default());
        state.record_output(&AgentName::new("a"), AgentOutput::new(json!({"x": 1})));
        state
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut checkpoint = RunCheckpoint::capture(&state("thread-1"), 0).unwrap();
        assert!(checkpoint.validate().is_ok());

        checkpoint.state.objective = "something else".to_string();
        assert!(matches!(
            checkpoint.validate(),
            Err(CheckpointError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_checkpoint_survives_json() {
        let checkpoint = RunCheckpoint::capture(&state("thread-1"), 0).unwrap();
        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: RunCheckpoint = serde_json::from_str(&json).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_agent_set_drift() {
        let checkpoint = RunCheckpoint::capture(&state("thread-1"), 0).unwrap();
        let same = [AgentName::new("a")];
        let grown = [AgentName::new("a"), AgentName::new("b")];
        assert!(!checkpoint.agent_set_changed(same.iter()));
        assert!(checkpoint.agent_set_changed(grown.iter()));
    }

    #[tokio::test]
    async fn test_in_memory_latest() {
        let store = InMemoryCheckpointStore::new();
        let mut state = state("thread-1");
        store.save(&RunCheckpoint::capture(&state, 0).unwrap()).await.unwrap();
        state.current_iteration = 1;
        store.save(&RunCheckpoint::capture(&state, 1).unwrap()).await.unwrap();

        assert_eq!(store.list("thread-1").await.unwrap(), vec![0, 1]);
        assert_eq!(store.latest("thread-1").await.unwrap().unwrap().iteration, 1);
        assert!(store.load("thread-1", 5).await.unwrap().is_none());

        store.delete("thread-1").await.unwrap();
        assert!(store.latest("thread-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path());
        let mut state = state("thread-1");
        for iteration in [0, 1, 2] {
            state.current_iteration = iteration;
            store
                .save(&RunCheckpoint::capture(&state, iteration).unwrap())
                .await
                .unwrap();
        }

        assert_eq!(store.list("thread-1").await.unwrap(), vec![0, 1, 2]);
        let latest = store.latest("thread-1").await.unwrap().unwrap();
        assert_eq!(latest.iteration, 2);
        assert!(latest.validate().is_ok());
        assert!(store.list("other").await.unwrap().is_empty());

        let escaping = RunCheckpoint::capture(&self::state("../escape"), 0).unwrap();
        assert!(matches!(
            store.save(&escaping).await,
            Err(CheckpointError::Storage(_))
        ));
    }
}
