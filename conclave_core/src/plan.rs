//! Version-stamped execution plans with a shared cache.
//!
//! An [`ExecutionPlan`] is derived from one agent snapshot and never
//! changes afterwards. The [`PlanCache`] swaps whole plans behind an
//! `Arc`, so readers see either the old plan or the new one, never a
//! half-updated graph. A plan derived from an older snapshot than the
//! cached one is handed back to its caller but never replaces the cache.

use crate::error::Result;
use crate::graph::{DependencyGraph, GraphLimits};
use crate::types::{AgentName, AgentSnapshot};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Immutable execution plan for one agent set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Cache-local version, increases on every rebuild
    pub version: u64,
    /// Store version of the snapshot the plan was derived from
    pub snapshot_version: u64,
    /// SHA-256 over the agent set and its resolved dependencies
    pub fingerprint: String,
    /// Dependencies first
    pub order: Vec<AgentName>,
    pub layers: Vec<Vec<AgentName>>,
    /// Resolved dependencies per agent
    pub dependencies: BTreeMap<AgentName, Vec<AgentName>>,
}

impl ExecutionPlan {
    /// Derives a plan from a snapshot.
    ///
    /// # Errors
    ///
    /// Fails with a graph error if the eligible agents form a cycle.
    pub fn derive(snapshot: &AgentSnapshot, version: u64, limits: GraphLimits) -> Result<Self> {
        let graph = DependencyGraph::build_with_limits(snapshot, limits);
        let order = graph.execution_order()?;
        let layers = graph.execution_layers()?;
        let dependencies = graph
            .nodes()
            .map(|n| (n.name.clone(), n.dependencies.clone()))
            .collect();

        Ok(Self {
            version,
            snapshot_version: snapshot.version,
            fingerprint: fingerprint(&graph),
            order,
            layers,
            dependencies,
        })
    }

    /// Returns the resolved dependencies of an agent.
    pub fn dependencies_of(&self, name: &AgentName) -> &[AgentName] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Computes the fingerprint of a graph's agent set.
///
/// Every name and dependency list is length-prefixed, so no choice of
/// agent names can make two different graphs hash the same input.
pub fn fingerprint(graph: &DependencyGraph) -> String {
    let mut hasher = Sha256::new();
    for node in graph.nodes() {
        hash_name(&mut hasher, &node.name);
        hasher.update((node.dependencies.len() as u64).to_le_bytes());
        for dep in &node.dependencies {
            hash_name(&mut hasher, dep);
        }
    }
    format!("{:x}", hasher.finalize())
}

fn hash_name(hasher: &mut Sha256, name: &AgentName) {
    hasher.update((name.as_str().len() as u64).to_le_bytes());
    hasher.update(name.as_str().as_bytes());
}

/// Shared cache holding the current execution plan.
///
/// # Examples
///
/// ```no_run
/// use conclave_core::{AgentRecord, AgentSnapshot, PlanCache};
///
/// # #[tokio::main]
/// # async fn main() -> conclave_core::Result<()> {
/// let cache = PlanCache::new();
/// let snapshot = AgentSnapshot::new(1, vec![AgentRecord::new("solo")]);
///
/// let plan = cache.get_or_build(&snapshot).await?;
/// assert_eq!(plan.order.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct PlanCache {
    limits: GraphLimits,
    current: Arc<RwLock<Option<Arc<ExecutionPlan>>>>,
    versions: Arc<AtomicU64>,
}

impl PlanCache {
    /// Creates an empty cache with default graph limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with explicit graph limits.
    pub fn with_limits(limits: GraphLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Returns the cached plan, if any.
    pub async fn current(&self) -> Option<Arc<ExecutionPlan>> {
        self.current.read().await.clone()
    }

    /// Returns the cached plan if it still matches the snapshot's agent set,
    /// otherwise derives and caches a new one.
    pub async fn get_or_build(&self, snapshot: &AgentSnapshot) -> Result<Arc<ExecutionPlan>> {
        let expected = fingerprint(&DependencyGraph::build_with_limits(snapshot, self.limits));
        if let Some(plan) = self.current.read().await.as_ref() {
            if plan.fingerprint == expected {
                return Ok(Arc::clone(plan));
            }
        }
        self.rebuild(snapshot).await
    }

    /// Derives a new plan from the snapshot and caches it.
    ///
    /// The plan replaces the cached one unless that was derived from a
    /// newer snapshot; a stale plan is returned without being cached.
    pub async fn rebuild(&self, snapshot: &AgentSnapshot) -> Result<Arc<ExecutionPlan>> {
        let plan = ExecutionPlan::derive(snapshot, 0, self.limits)?;
        Ok(self.publish(plan).await)
    }

    /// Stamps a version on `plan` and swaps it in under the write lock.
    async fn publish(&self, mut plan: ExecutionPlan) -> Arc<ExecutionPlan> {
        let mut current = self.current.write().await;
        plan.version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = Arc::new(plan);

        if let Some(cached) = current.as_ref() {
            if cached.snapshot_version > plan.snapshot_version {
                tracing::debug!(
                    cached = cached.snapshot_version,
                    stale = plan.snapshot_version,
                    "plan from stale snapshot not cached"
                );
                return plan;
            }
        }

        *current = Some(Arc::clone(&plan));
        tracing::debug!(
            version = plan.version,
            agents = plan.len(),
            "execution plan rebuilt"
        );
        plan
    }

    /// Rebuilds the plan as if `name` were absent from the snapshot.
    pub async fn rebuild_excluding(
        &self,
        snapshot: &AgentSnapshot,
        name: &AgentName,
    ) -> Result<Arc<ExecutionPlan>> {
        self.rebuild(&snapshot.without(name)).await
    }

    /// Drops the cached plan.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConclaveError, GraphError};
    use crate::types::AgentRecord;

    fn mas(version: u64) -> AgentSnapshot {
        AgentSnapshot::new(
            version,
            vec![
                AgentRecord::new("M"),
                AgentRecord::new("A").with_dependencies(["M"]),
                AgentRecord::new("S").with_dependencies(["M", "A"]),
            ],
        )
    }

    #[tokio::test]
    async fn test_plan_order() {
        let cache = PlanCache::new();
        let plan = cache.get_or_build(&mas(1)).await.unwrap();
        let order: Vec<&str> = plan.order.iter().map(AgentName::as_str).collect();
        assert_eq!(order, vec!["M", "A", "S"]);
        assert_eq!(plan.dependencies_of(&AgentName::new("S")).len(), 2);
    }

    #[tokio::test]
    async fn test_cached_plan_reused_for_same_agent_set() {
        let cache = PlanCache::new();
        let first = cache.get_or_build(&mas(1)).await.unwrap();
        let second = cache.get_or_build(&mas(2)).await.unwrap();
        assert_eq!(first.version, second.version);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_changed_agent_set_rebuilds() {
        let cache = PlanCache::new();
        let first = cache.get_or_build(&mas(1)).await.unwrap();

        let mut changed = mas(2);
        changed.agents.push(AgentRecord::new("W").with_dependencies(["S"]));
        let second = cache.get_or_build(&changed).await.unwrap();

        assert!(second.version > first.version);
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(second.order.last(), Some(&AgentName::new("W")));
    }

    #[tokio::test]
    async fn test_rebuild_excluding() {
        let cache = PlanCache::new();
        let plan = cache
            .rebuild_excluding(&mas(1), &AgentName::new("S"))
            .await
            .unwrap();
        assert!(!plan.contains(&AgentName::new("S")));
        assert_eq!(cache.current().await.unwrap().version, plan.version);
    }

    #[tokio::test]
    async fn test_cyclic_snapshot_rejected() {
        let cache = PlanCache::new();
        let snapshot = AgentSnapshot::new(
            1,
            vec![
                AgentRecord::new("A").with_dependencies(["B"]),
                AgentRecord::new("B").with_dependencies(["A"]),
            ],
        );
        let result = cache.get_or_build(&snapshot).await;
        assert!(matches!(
            result,
            Err(ConclaveError::Graph(GraphError::CycleDetected(_)))
        ));
        assert!(cache.current().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_replace_newer_plan() {
        let cache = PlanCache::new();
        let mut newer = mas(5);
        newer.agents.push(AgentRecord::new("W").with_dependencies(["S"]));
        let cached = cache.rebuild(&newer).await.unwrap();

        let stale = cache.get_or_build(&mas(3)).await.unwrap();
        assert!(!stale.contains(&AgentName::new("W")));
        assert!(stale.version > cached.version);

        let current = cache.current().await.unwrap();
        assert!(Arc::ptr_eq(&current, &cached));
        assert_eq!(current.snapshot_version, 5);
    }

    #[tokio::test]
    async fn test_cached_versions_only_grow() {
        let cache = PlanCache::new();
        let first = cache.rebuild(&mas(2)).await.unwrap();
        let second = cache.rebuild(&mas(2)).await.unwrap();
        assert!(second.version > first.version);
        assert_eq!(cache.current().await.unwrap().version, second.version);

        cache.rebuild(&mas(1)).await.unwrap();
        assert_eq!(cache.current().await.unwrap().version, second.version);
    }

    #[test]
    fn test_fingerprint_separates_names_with_separator_text() {
        let split = DependencyGraph::build(&AgentSnapshot::new(
            1,
            vec![AgentRecord::new("a"), AgentRecord::new("b")],
        ));
        let joined = DependencyGraph::build(&AgentSnapshot::new(
            1,
            vec![AgentRecord::new("a<-;b")],
        ));
        assert_ne!(fingerprint(&split), fingerprint(&joined));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = PlanCache::new();
        cache.get_or_build(&mas(1)).await.unwrap();
        cache.invalidate().await;
        assert!(cache.current().await.is_none());
    }
}
