//! Agent store collaborator interface.
//!
//! The store owns persistent agent records. The graph layer only reads
//! versioned snapshots from it; lifecycle operations write through it
//! inside a store transaction that can be rolled back as a final safety
//! net.

use crate::error::StoreError;
use crate::types::{AgentName, AgentRecord, AgentSnapshot};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistent storage for agent records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Takes a versioned snapshot of every record.
    async fn snapshot(&self) -> Result<AgentSnapshot, StoreError>;

    /// Fetches one record.
    async fn get(&self, name: &AgentName) -> Result<Option<AgentRecord>, StoreError>;

    /// Inserts a new record.
    async fn insert(&self, record: AgentRecord) -> Result<(), StoreError>;

    /// Replaces an existing record, returning the previous one.
    async fn update(&self, record: AgentRecord) -> Result<AgentRecord, StoreError>;

    /// Removes a record, returning it.
    async fn remove(&self, name: &AgentName) -> Result<AgentRecord, StoreError>;

    /// Opens a transaction scope for one lifecycle operation.
    async fn begin(&self, transaction: &str) -> Result<(), StoreError>;

    /// Makes the transaction's writes final.
    async fn commit(&self, transaction: &str) -> Result<(), StoreError>;

    /// Discards every write made since `begin`.
    async fn rollback(&self, transaction: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<AgentName, AgentRecord>,
    version: u64,
    open: HashMap<String, BTreeMap<AgentName, AgentRecord>>,
}

impl StoreInner {
    fn bump(&mut self) {
        self.version += 1;
    }
}

/// In-memory agent store.
///
/// Transactions keep a copy of the records taken at `begin`; `rollback`
/// restores that copy.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAgentStore {
    inner: Arc<RwLock<StoreInner>>,
    rollbacks: Arc<AtomicUsize>,
}

impl InMemoryAgentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    pub fn with_records(records: impl IntoIterator<Item = AgentRecord>) -> Self {
        let inner = StoreInner {
            records: records.into_iter().map(|r| (r.name.clone(), r)).collect(),
            version: 1,
            open: HashMap::new(),
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
            rollbacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of transaction rollbacks performed so far.
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Current store version.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn snapshot(&self) -> Result<AgentSnapshot, StoreError> {
        let inner = self.inner.read().await;
        Ok(AgentSnapshot::new(
            inner.version,
            inner.records.values().cloned().collect(),
        ))
    }

    async fn get(&self, name: &AgentName) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(name).cloned())
    }

    async fn insert(&self, record: AgentRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.name) {
            return Err(StoreError::AlreadyExists(record.name));
        }
        inner.records.insert(record.name.clone(), record);
        inner.bump();
        Ok(())
    }

    async fn update(&self, record: AgentRecord) -> Result<AgentRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(previous) = inner.records.get(&record.name).cloned() else {
            return Err(StoreError::NotFound(record.name));
        };
        inner.records.insert(record.name.clone(), record);
        inner.bump();
        Ok(previous)
    }

    async fn remove(&self, name: &AgentName) -> Result<AgentRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .records
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        inner.bump();
        Ok(removed)
    }

    async fn begin(&self, transaction: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let saved = inner.records.clone();
        inner.open.insert(transaction.to_string(), saved);
        Ok(())
    }

    async fn commit(&self, transaction: &str) -> Result<(), StoreError> {
        self.inner.write().await.open.remove(transaction);
        Ok(())
    }

    async fn rollback(&self, transaction: &str) -> Result<(), StoreError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        match inner.open.remove(transaction) {
            Some(saved) => {
                if saved != inner.records {
                    inner.records = saved;
                    inner.bump();
                }
                tracing::debug!(transaction, "store transaction rolled back");
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "no open transaction {}",
                transaction
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_bumps_version() {
        let store = InMemoryAgentStore::new();
        store.insert(AgentRecord::new("a")).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryAgentStore::with_records([AgentRecord::new("a")]);
        let err = store.insert(AgentRecord::new("a")).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(AgentName::new("a")));
    }

    #[tokio::test]
    async fn test_update_returns_previous() {
        let store = InMemoryAgentStore::with_records([AgentRecord::new("a").with_role("old")]);
        let previous = store
            .update(AgentRecord::new("a").with_role("new"))
            .await
            .unwrap();
        assert_eq!(previous.role, "old");
        let current = store.get(&AgentName::new("a")).await.unwrap().unwrap();
        assert_eq!(current.role, "new");
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let store = InMemoryAgentStore::new();
        let err = store.remove(&AgentName::new("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_restores_records() {
        let store = InMemoryAgentStore::with_records([AgentRecord::new("a")]);
        store.begin("tx-1").await.unwrap();
        store.insert(AgentRecord::new("b")).await.unwrap();
        store.remove(&AgentName::new("a")).await.unwrap();

        store.rollback("tx-1").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.names(), vec![AgentName::new("a")]);
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_closes_transaction() {
        let store = InMemoryAgentStore::new();
        store.begin("tx-1").await.unwrap();
        store.insert(AgentRecord::new("a")).await.unwrap();
        store.commit("tx-1").await.unwrap();

        assert!(store.rollback("tx-1").await.is_err());
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }
}
