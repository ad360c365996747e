//! Common test utilities for ConclaveKit agent integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conclave_agent::gate::ExecutionGate;
use conclave_agent::saga::{
    InMemoryDefinitionGenerator, LifecycleManager, RosterPropagator, SagaEngine,
};
use conclave_agent::workflow::{
    AgentOutput, ExecutorRegistry, FnExecutor, InMemoryCheckpointStore, Scheduler,
};
use conclave_core::{
    AgentName, AgentRecord, AgentSnapshot, AgentStore, InMemoryAgentStore, PlanCache, StoreError,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper with injectable faults.
///
/// Inserts fail while `fail_inserts` is set and sleep `insert_delay_ms`
/// first. The next snapshot fails once `fail_next_snapshot` is set.
/// Everything else, transactions included, goes to the wrapped store.
#[derive(Clone, Default)]
pub struct FailingStore {
    pub inner: InMemoryAgentStore,
    pub fail_inserts: Arc<AtomicBool>,
    pub fail_next_snapshot: Arc<AtomicBool>,
    pub insert_delay_ms: Arc<AtomicU64>,
}

impl FailingStore {
    pub fn new(inner: InMemoryAgentStore) -> Self {
        Self {
            inner,
            fail_inserts: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        }
    }

    /// Store that accepts everything, delaying each insert by `delay`.
    pub fn slow(inner: InMemoryAgentStore, delay: Duration) -> Self {
        let store = Self {
            inner,
            ..Default::default()
        };
        store
            .insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        store
    }
}

#[async_trait]
impl AgentStore for FailingStore {
    async fn snapshot(&self) -> Result<AgentSnapshot, StoreError> {
        if self.fail_next_snapshot.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.snapshot().await
    }

    async fn get(&self, name: &AgentName) -> Result<Option<AgentRecord>, StoreError> {
        self.inner.get(name).await
    }

    async fn insert(&self, record: AgentRecord) -> Result<(), StoreError> {
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.insert(record).await
    }

    async fn update(&self, record: AgentRecord) -> Result<AgentRecord, StoreError> {
        self.inner.update(record).await
    }

    async fn remove(&self, name: &AgentName) -> Result<AgentRecord, StoreError> {
        self.inner.remove(name).await
    }

    async fn begin(&self, transaction: &str) -> Result<(), StoreError> {
        self.inner.begin(transaction).await
    }

    async fn commit(&self, transaction: &str) -> Result<(), StoreError> {
        self.inner.commit(transaction).await
    }

    async fn rollback(&self, transaction: &str) -> Result<(), StoreError> {
        self.inner.rollback(transaction).await
    }
}

/// Market, analyst and summarizer: A depends on M, S depends on A and M.
pub fn research_roster() -> Vec<AgentRecord> {
    vec![
        AgentRecord::new("market"),
        AgentRecord::new("analyst").with_dependencies(["market"]),
        AgentRecord::new("summarizer").with_dependencies(["analyst", "market"]),
    ]
}

/// Lifecycle manager over `store` with in-memory collaborators.
pub fn lifecycle(store: Arc<dyn AgentStore>, gate: ExecutionGate) -> LifecycleManager {
    let engine = SagaEngine::new(
        store,
        Arc::new(InMemoryDefinitionGenerator::new()),
        Arc::new(RosterPropagator::new()),
        PlanCache::new(),
    );
    LifecycleManager::new(engine, gate)
}

/// Executors answering with a constant output for every agent.
pub fn constant_executors() -> ExecutorRegistry {
    ExecutorRegistry::new().with_fallback(Arc::new(FnExecutor::new(|ctx| {
        Ok(AgentOutput::new(json!({ "agent": ctx.agent.as_str() })))
    })))
}

/// Scheduler over an in-memory store and checkpoint store.
pub fn scheduler(records: Vec<AgentRecord>, executors: ExecutorRegistry) -> Scheduler {
    Scheduler::new(
        Arc::new(InMemoryAgentStore::with_records(records)),
        PlanCache::new(),
        executors,
        Arc::new(InMemoryCheckpointStore::new()),
    )
}

pub fn names(names: &[&str]) -> Vec<AgentName> {
    names.iter().map(|n| AgentName::new(*n)).collect()
}
