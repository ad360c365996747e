//! Integration tests for the dependency graph and execution plans.

use conclave_core::{
    AgentName, AgentRecord, AgentStatus, AgentStore, ConclaveError, DependencyGraph, GraphError,
    InMemoryAgentStore, PlanCache,
};

fn names(names: &[&str]) -> Vec<AgentName> {
    names.iter().map(|n| AgentName::new(*n)).collect()
}

fn position(order: &[AgentName], name: &str) -> usize {
    order
        .iter()
        .position(|n| n.as_str() == name)
        .unwrap_or(usize::MAX)
}

fn pipeline() -> Vec<AgentRecord> {
    vec![
        AgentRecord::new("coordinator"),
        AgentRecord::new("market"),
        AgentRecord::new("analyst").with_dependencies(["market"]),
        AgentRecord::new("summarizer").with_dependencies(["analyst", "market"]),
        AgentRecord::new("draft")
            .with_dependencies(["summarizer"])
            .with_status(AgentStatus::Configuring),
    ]
}

#[tokio::test]
async fn test_plan_follows_store_changes() {
    let store = InMemoryAgentStore::with_records(pipeline());
    let cache = PlanCache::new();

    let first = cache
        .get_or_build(&store.snapshot().await.unwrap())
        .await
        .unwrap();
    assert_eq!(first.len(), 4);
    assert!(!first.contains(&AgentName::new("draft")));
    assert!(position(&first.order, "market") < position(&first.order, "analyst"));
    assert!(position(&first.order, "analyst") < position(&first.order, "summarizer"));

    // Same agent set, new store version: cached plan is reused.
    store
        .update(AgentRecord::new("market").with_role("data"))
        .await
        .unwrap();
    let same = cache
        .get_or_build(&store.snapshot().await.unwrap())
        .await
        .unwrap();
    assert_eq!(same.version, first.version);

    store
        .insert(AgentRecord::new("critic").with_dependencies(["summarizer"]))
        .await
        .unwrap();
    let grown = cache
        .get_or_build(&store.snapshot().await.unwrap())
        .await
        .unwrap();
    assert!(grown.version > first.version);
    assert!(position(&grown.order, "summarizer") < position(&grown.order, "critic"));
}

#[tokio::test]
async fn test_cyclic_store_has_no_plan() {
    let store = InMemoryAgentStore::with_records([
        AgentRecord::new("a").with_dependencies(["b"]),
        AgentRecord::new("b").with_dependencies(["a"]),
    ]);
    let cache = PlanCache::new();

    let err = cache
        .get_or_build(&store.snapshot().await.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConclaveError::Graph(GraphError::CycleDetected(_))
    ));
    assert!(cache.current().await.is_none());
}

#[test]
fn test_report_over_mixed_roster() {
    let snapshot = conclave_core::AgentSnapshot::new(1, pipeline());
    let graph = DependencyGraph::build(&snapshot);

    assert!(!graph.contains(&AgentName::new("draft")));
    assert!(graph.detect_cycles().is_empty());

    let report = graph.report();
    assert!(report.validation.is_valid());

    let plan = graph.analyze_deletion_impact(&AgentName::new("analyst"));
    assert_eq!(plan.deletion_order, names(&["summarizer", "analyst"]));
    assert_eq!(plan.dependent_agents, names(&["summarizer"]));
}
