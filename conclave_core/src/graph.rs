//! Agent dependency graph built from a point-in-time snapshot.
//!
//! The graph is a pure value: it is built fresh from an [`AgentSnapshot`],
//! never persisted, and never mutated in place by speculative checks.
//! Proposed changes are validated against a private copy.
//!
//! Edges point from an agent to the agents it depends on. Reverse edges
//! (dependents) are derived and recomputed whenever any dependency list
//! in the graph changes.

use crate::error::GraphError;
use crate::types::{AgentName, AgentSnapshot, AgentStatus};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Warning thresholds applied by graph analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphLimits {
    /// Chains longer than this many agents produce a warning
    pub long_chain_warning: usize,
    /// Cascades affecting more than this many agents produce a warning
    pub cascade_warning_threshold: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            long_chain_warning: 5,
            cascade_warning_threshold: 5,
        }
    }
}

/// One agent in the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNode {
    pub name: AgentName,
    /// Declared dependencies that resolve to a node in the same graph
    pub dependencies: Vec<AgentName>,
    /// Agents that depend on this one (derived)
    pub dependents: Vec<AgentName>,
}

impl AgentNode {
    fn new(name: AgentName, dependencies: Vec<AgentName>) -> Self {
        Self {
            name,
            dependencies,
            dependents: Vec::new(),
        }
    }
}

/// A dependency reference excluded from the graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedReference {
    /// Agent declaring the dependency
    pub agent: AgentName,
    /// Referenced agent with no matching node
    pub missing: AgentName,
    /// Status of the referenced agent, if it exists but is ineligible
    pub excluded_status: Option<AgentStatus>,
}

impl OrphanedReference {
    fn describe(&self) -> String {
        match self.excluded_status {
            Some(status) => format!(
                "{} depends on agent {} which is excluded from the graph (status {:?})",
                self.agent, self.missing, status
            ),
            None => format!(
                "{} depends on non-existent agent: {}",
                self.agent, self.missing
            ),
        }
    }
}

/// Plan describing the consequences of deleting one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub target: AgentName,
    /// True iff no other agent depends on the target
    pub can_delete_safely: bool,
    /// Agents directly depending on the target
    pub dependent_agents: Vec<AgentName>,
    pub cascade_deletion_required: bool,
    /// Dependents first, the target last
    pub deletion_order: Vec<AgentName>,
    pub warnings: Vec<String>,
}

/// Result of validating the whole graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphValidationReport {
    is_valid: bool,
    issues: Vec<String>,
    warnings: Vec<String>,
    cycles: Vec<Vec<AgentName>>,
    orphaned: Vec<String>,
}

impl GraphValidationReport {
    /// Returns whether the graph has no blocking issues.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cycles(&self) -> &[Vec<AgentName>] {
        &self.cycles
    }

    pub fn orphaned(&self) -> &[String] {
        &self.orphaned
    }
}

/// Aggregate counts over the graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStatistics {
    pub total_agents: usize,
    pub agents_with_dependencies: usize,
    pub agents_with_dependents: usize,
    pub longest_chain: usize,
}

/// Full dependency report: statistics, categories and adjacency.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub statistics: DependencyStatistics,
    /// No dependencies and no dependents
    pub isolated_agents: Vec<AgentName>,
    /// No dependencies but at least one dependent
    pub root_agents: Vec<AgentName>,
    /// Dependencies but no dependents
    pub leaf_agents: Vec<AgentName>,
    pub dependencies: BTreeMap<AgentName, Vec<AgentName>>,
    pub validation: GraphValidationReport,
}

/// Directed graph of agent dependencies.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<AgentName, AgentNode>,
    orphaned: Vec<OrphanedReference>,
    self_references: Vec<AgentName>,
    limits: GraphLimits,
}

impl DependencyGraph {
    /// Builds a graph from a snapshot using default limits.
    ///
    /// Only graph-eligible agents become nodes. References to unknown or
    /// ineligible agents are excluded from the edges and remembered as
    /// orphaned references; self references are dropped. Never fails.
    pub fn build(snapshot: &AgentSnapshot) -> Self {
        Self::build_with_limits(snapshot, GraphLimits::default())
    }

    /// Builds a graph from a snapshot with explicit warning limits.
    pub fn build_with_limits(snapshot: &AgentSnapshot, limits: GraphLimits) -> Self {
        let statuses: HashMap<&AgentName, AgentStatus> =
            snapshot.agents.iter().map(|r| (&r.name, r.status)).collect();

        let mut graph = Self {
            limits,
            ..Self::default()
        };

        for record in snapshot.agents.iter().filter(|r| r.status.is_graph_eligible()) {
            let mut dependencies = Vec::new();
            for dep in &record.dependencies {
                if dep == &record.name {
                    graph.self_references.push(record.name.clone());
                    continue;
                }
                match statuses.get(dep) {
                    Some(status) if status.is_graph_eligible() => {
                        if !dependencies.contains(dep) {
                            dependencies.push(dep.clone());
                        }
                    }
                    other => graph.orphaned.push(OrphanedReference {
                        agent: record.name.clone(),
                        missing: dep.clone(),
                        excluded_status: other.copied(),
                    }),
                }
            }
            graph.nodes.insert(
                record.name.clone(),
                AgentNode::new(record.name.clone(), dependencies),
            );
        }

        graph.recompute_dependents();
        graph
    }

    /// Returns the warning limits in effect.
    pub fn limits(&self) -> GraphLimits {
        self.limits
    }

    /// Looks up a node by name.
    pub fn node(&self, name: &AgentName) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    /// Iterates over nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &AgentNode> {
        self.nodes.values()
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the agent names in name order.
    pub fn agent_names(&self) -> Vec<AgentName> {
        self.nodes.keys().cloned().collect()
    }

    /// Returns the resolved dependencies of an agent.
    pub fn dependencies_of(&self, name: &AgentName) -> &[AgentName] {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the agents that depend on `name`.
    pub fn dependents_of(&self, name: &AgentName) -> &[AgentName] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Agents whose self references were dropped while building.
    pub fn self_references(&self) -> &[AgentName] {
        &self.self_references
    }

    fn recompute_dependents(&mut self) {
        let mut reverse: BTreeMap<AgentName, Vec<AgentName>> = BTreeMap::new();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if self.nodes.contains_key(dep) {
                    reverse.entry(dep.clone()).or_default().push(node.name.clone());
                }
            }
        }
        for node in self.nodes.values_mut() {
            node.dependents = reverse.remove(&node.name).unwrap_or_default();
        }
    }

    /// Detects every cycle reachable in the graph.
    ///
    /// Runs a path-tracking depth-first walk from every node along dependency
    /// edges. Revisiting a node already on the current path reports the
    /// sub-path from that node to the revisit, inclusive, so a reported cycle
    /// starts and ends with the same agent.
    ///
    /// Cycles found from different start nodes are deduplicated: each cycle
    /// is rotated so its smallest name comes first, and only the first
    /// occurrence of each rotation is kept.
    pub fn detect_cycles(&self) -> Vec<Vec<AgentName>> {
        let mut cycles = Vec::new();
        let mut seen: BTreeSet<Vec<AgentName>> = BTreeSet::new();

        for start in self.nodes.keys() {
            let mut path: Vec<&AgentName> = Vec::new();
            let mut explored: HashSet<&AgentName> = HashSet::new();
            self.walk_for_cycles(start, &mut path, &mut explored, &mut |cycle: Vec<AgentName>| {
                let canonical = canonical_cycle(&cycle);
                if seen.insert(canonical.clone()) {
                    cycles.push(canonical);
                }
            });
        }

        cycles
    }

    fn walk_for_cycles<'a>(
        &'a self,
        name: &'a AgentName,
        path: &mut Vec<&'a AgentName>,
        explored: &mut HashSet<&'a AgentName>,
        report: &mut dyn FnMut(Vec<AgentName>),
    ) {
        if let Some(pos) = path.iter().position(|n| *n == name) {
            let mut cycle: Vec<AgentName> = path[pos..].iter().map(|n| (*n).clone()).collect();
            cycle.push(name.clone());
            report(cycle);
            return;
        }
        if !explored.insert(name) {
            return;
        }

        path.push(name);
        if let Some(node) = self.nodes.get(name) {
            for dep in &node.dependencies {
                self.walk_for_cycles(dep, path, explored, report);
            }
        }
        path.pop();
    }

    /// Describes every dependency reference with no matching node.
    ///
    /// Informational only; orphaned references never make the graph invalid.
    pub fn find_orphaned_dependencies(&self) -> Vec<String> {
        self.orphaned.iter().map(OrphanedReference::describe).collect()
    }

    /// Returns the raw orphaned references.
    pub fn orphaned_references(&self) -> &[OrphanedReference] {
        &self.orphaned
    }

    /// Computes what deleting `name` would require.
    ///
    /// With no dependents the plan is trivial: safe, single element. Otherwise
    /// every agent transitively depending on `name` is collected and ordered
    /// so each agent precedes the agents it depends on.
    pub fn analyze_deletion_impact(&self, name: &AgentName) -> DeletionPlan {
        let Some(node) = self.nodes.get(name) else {
            return DeletionPlan {
                target: name.clone(),
                can_delete_safely: false,
                dependent_agents: Vec::new(),
                cascade_deletion_required: false,
                deletion_order: Vec::new(),
                warnings: vec![format!("Agent {} not found", name)],
            };
        };

        if node.dependents.is_empty() {
            return DeletionPlan {
                target: name.clone(),
                can_delete_safely: true,
                dependent_agents: Vec::new(),
                cascade_deletion_required: false,
                deletion_order: vec![name.clone()],
                warnings: Vec::new(),
            };
        }

        let mut deletion_order = Vec::new();
        let mut marked = HashSet::new();
        self.visit_dependents_first(name, &mut marked, &mut deletion_order);

        let mut warnings = Vec::new();
        if deletion_order.len() > self.limits.cascade_warning_threshold {
            warnings.push(format!(
                "Cascade deletion would affect {} agents",
                deletion_order.len()
            ));
        }

        DeletionPlan {
            target: name.clone(),
            can_delete_safely: false,
            dependent_agents: node.dependents.clone(),
            cascade_deletion_required: true,
            deletion_order,
            warnings,
        }
    }

    fn visit_dependents_first<'a>(
        &'a self,
        name: &'a AgentName,
        marked: &mut HashSet<&'a AgentName>,
        order: &mut Vec<AgentName>,
    ) {
        if !marked.insert(name) {
            return;
        }
        for dependent in self.dependents_of(name) {
            self.visit_dependents_first(dependent, marked, order);
        }
        order.push(name.clone());
    }

    /// Returns a copy of the graph with `name`'s dependencies replaced.
    ///
    /// Inserts `name` as a new node when it is not yet part of the graph.
    /// Dependencies on agents outside the graph are recorded as orphaned.
    /// `self` is left untouched.
    pub fn with_proposed_dependencies(
        &self,
        name: &AgentName,
        dependencies: &[AgentName],
    ) -> DependencyGraph {
        let mut copy = self.clone();
        copy.orphaned.retain(|o| &o.agent != name);
        copy.self_references.retain(|n| n != name);

        let mut resolved = Vec::new();
        for dep in dependencies {
            if dep == name {
                copy.self_references.push(name.clone());
            } else if copy.nodes.contains_key(dep) {
                if !resolved.contains(dep) {
                    resolved.push(dep.clone());
                }
            } else {
                copy.orphaned.push(OrphanedReference {
                    agent: name.clone(),
                    missing: dep.clone(),
                    excluded_status: None,
                });
            }
        }

        // A new agent satisfies references that were orphaned only because it
        // did not exist yet.
        let adopters: Vec<AgentName> = copy
            .orphaned
            .iter()
            .filter(|o| &o.missing == name && o.excluded_status.is_none())
            .map(|o| o.agent.clone())
            .collect();
        copy.orphaned
            .retain(|o| !(&o.missing == name && o.excluded_status.is_none()));
        for agent in adopters {
            if let Some(node) = copy.nodes.get_mut(&agent) {
                if !node.dependencies.contains(name) {
                    node.dependencies.push(name.clone());
                }
            }
        }

        copy.nodes
            .insert(name.clone(), AgentNode::new(name.clone(), resolved));
        copy.recompute_dependents();
        copy
    }

    /// Checks whether replacing `name`'s dependencies keeps the graph acyclic.
    ///
    /// The check runs on a hypothetical copy; the live graph is never
    /// mutated. A dependency on itself is reported as a one-agent cycle.
    pub fn validate_proposed_dependencies(
        &self,
        name: &AgentName,
        dependencies: &[AgentName],
    ) -> Result<(), GraphError> {
        if dependencies.contains(name) {
            return Err(GraphError::CircularDependency {
                agent: name.clone(),
                cycles: vec![vec![name.clone(), name.clone()]],
            });
        }

        let hypothetical = self.with_proposed_dependencies(name, dependencies);
        let cycles = hypothetical.detect_cycles();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(GraphError::CircularDependency {
                agent: name.clone(),
                cycles,
            })
        }
    }

    /// Length of the longest dependency chain starting at `name`, in agents.
    ///
    /// An agent with no dependencies has depth 1; an unknown agent has depth 0.
    /// Revisiting an agent already on the current chain contributes 0, so
    /// cyclic graphs terminate.
    pub fn chain_depth(&self, name: &AgentName) -> usize {
        let mut memo = HashMap::new();
        let mut visiting = HashSet::new();
        self.chain_depth_inner(name, &mut visiting, &mut memo)
    }

    fn chain_depth_inner<'a>(
        &'a self,
        name: &'a AgentName,
        visiting: &mut HashSet<&'a AgentName>,
        memo: &mut HashMap<&'a AgentName, usize>,
    ) -> usize {
        if let Some(depth) = memo.get(name) {
            return *depth;
        }
        let Some(node) = self.nodes.get(name) else {
            return 0;
        };
        if !visiting.insert(name) {
            return 0;
        }

        let deepest = node
            .dependencies
            .iter()
            .map(|dep| self.chain_depth_inner(dep, visiting, memo))
            .max()
            .unwrap_or(0);

        visiting.remove(name);
        memo.insert(name, deepest + 1);
        deepest + 1
    }

    /// Validates the whole graph.
    ///
    /// Cycles are issues and make the report invalid. Orphaned references,
    /// dropped self references and long chains are warnings only.
    pub fn validate(&self) -> GraphValidationReport {
        let cycles = self.detect_cycles();
        let orphaned = self.find_orphaned_dependencies();

        let issues: Vec<String> = cycles
            .iter()
            .map(|cycle| {
                let names: Vec<&str> = cycle.iter().map(AgentName::as_str).collect();
                format!("Circular dependency detected: {}", names.join(" -> "))
            })
            .collect();

        let mut warnings = orphaned.clone();
        for name in &self.self_references {
            warnings.push(format!("{} declares a dependency on itself", name));
        }
        for name in self.nodes.keys() {
            let depth = self.chain_depth(name);
            if depth > self.limits.long_chain_warning {
                warnings.push(format!(
                    "Agent {} has very long dependency chain ({} levels)",
                    name, depth
                ));
            }
        }

        GraphValidationReport {
            is_valid: issues.is_empty(),
            issues,
            warnings,
            cycles,
            orphaned,
        }
    }

    /// Produces statistics, categories and adjacency for the graph.
    pub fn report(&self) -> DependencyReport {
        let mut report = DependencyReport {
            validation: self.validate(),
            ..DependencyReport::default()
        };

        for node in self.nodes.values() {
            let has_deps = !node.dependencies.is_empty();
            let has_dependents = !node.dependents.is_empty();
            match (has_deps, has_dependents) {
                (false, false) => report.isolated_agents.push(node.name.clone()),
                (false, true) => report.root_agents.push(node.name.clone()),
                (true, false) => report.leaf_agents.push(node.name.clone()),
                (true, true) => {}
            }
            report
                .dependencies
                .insert(node.name.clone(), node.dependencies.clone());
        }

        report.statistics = DependencyStatistics {
            total_agents: self.nodes.len(),
            agents_with_dependencies: self
                .nodes
                .values()
                .filter(|n| !n.dependencies.is_empty())
                .count(),
            agents_with_dependents: self
                .nodes
                .values()
                .filter(|n| !n.dependents.is_empty())
                .count(),
            longest_chain: self
                .nodes
                .keys()
                .map(|n| self.chain_depth(n))
                .max()
                .unwrap_or(0),
        };

        report
    }

    /// Converts the graph into a petgraph DiGraph.
    ///
    /// Edges run from dependency to dependent, so a topological sort yields
    /// dependencies first.
    pub fn to_digraph(&self) -> (DiGraph<AgentName, ()>, HashMap<AgentName, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for name in self.nodes.keys() {
            index.insert(name.clone(), graph.add_node(name.clone()));
        }
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if let (Some(&from), Some(&to)) = (index.get(dep), index.get(&node.name)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        (graph, index)
    }

    /// Returns agents in dependency order (dependencies first).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph is cyclic.
    pub fn execution_order(&self) -> Result<Vec<AgentName>, GraphError> {
        let (graph, _) = self.to_digraph();
        match toposort(&graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|idx| graph[idx].clone()).collect()),
            Err(cycle) => {
                let start = graph[cycle.node_id()].clone();
                let detected = self
                    .detect_cycles()
                    .into_iter()
                    .find(|c| c.contains(&start))
                    .unwrap_or_else(|| vec![start]);
                Err(GraphError::CycleDetected(detected))
            }
        }
    }

    /// Groups agents into layers by dependency depth.
    ///
    /// Layer 0 holds agents with no dependencies; every other agent sits one
    /// layer after its deepest dependency.
    pub fn execution_layers(&self) -> Result<Vec<Vec<AgentName>>, GraphError> {
        let order = self.execution_order()?;
        let mut level: HashMap<&AgentName, usize> = HashMap::new();
        let mut layers: Vec<Vec<AgentName>> = Vec::new();

        for name in &order {
            let layer = self
                .dependencies_of(name)
                .iter()
                .filter_map(|dep| level.get(dep).map(|l| l + 1))
                .max()
                .unwrap_or(0);
            level.insert(name, layer);
            if layers.len() <= layer {
                layers.resize_with(layer + 1, Vec::new);
            }
            layers[layer].push(name.clone());
        }

        for layer in &mut layers {
            layer.sort();
        }
        Ok(layers)
    }
}

/// Rotates a closed cycle so its smallest name comes first, re-closing it.
fn canonical_cycle(cycle: &[AgentName]) -> Vec<AgentName> {
    let open = &cycle[..cycle.len().saturating_sub(1)];
    if open.is_empty() {
        return cycle.to_vec();
    }
    let min_pos = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut rotated: Vec<AgentName> = open[min_pos..]
        .iter()
        .chain(open[..min_pos].iter())
        .cloned()
        .collect();
    rotated.push(rotated[0].clone());
    rotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentRecord;

    fn name(s: &str) -> AgentName {
        AgentName::new(s)
    }

    fn snapshot(records: Vec<AgentRecord>) -> AgentSnapshot {
        AgentSnapshot::new(1, records)
    }

    fn mas() -> DependencyGraph {
        DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("M"),
            AgentRecord::new("A").with_dependencies(["M"]),
            AgentRecord::new("S").with_dependencies(["M", "A"]),
        ]))
    }

    #[test]
    fn test_build_computes_dependents() {
        let graph = mas();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependents_of(&name("M")), &[name("A"), name("S")]);
        assert_eq!(graph.dependents_of(&name("A")), &[name("S")]);
        assert!(graph.dependents_of(&name("S")).is_empty());
    }

    #[test]
    fn test_build_excludes_ineligible_agents() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("base").with_status(AgentStatus::Error),
            AgentRecord::new("worker").with_dependencies(["base", "ghost"]),
        ]));

        assert_eq!(graph.agent_names(), vec![name("worker")]);
        assert!(graph.dependencies_of(&name("worker")).is_empty());

        let orphans = graph.find_orphaned_dependencies();
        assert_eq!(orphans.len(), 2);
        assert!(orphans.iter().any(|o| o.contains("ghost")));
        assert!(orphans.iter().any(|o| o.contains("excluded")));
    }

    #[test]
    fn test_build_drops_self_reference() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("loop").with_dependencies(["loop"])
        ]));
        assert!(graph.dependencies_of(&name("loop")).is_empty());
        assert_eq!(graph.self_references(), &[name("loop")]);
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn test_acyclic_graph_has_no_cycles() {
        assert!(mas().detect_cycles().is_empty());
    }

    #[test]
    fn test_two_node_cycle_reported_once() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("A").with_dependencies(["B"]),
            AgentRecord::new("B").with_dependencies(["A"]),
        ]));

        let cycles = graph.detect_cycles();
        assert_eq!(cycles, vec![vec![name("A"), name("B"), name("A")]]);
    }

    #[test]
    fn test_disjoint_cycles_both_reported() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("a").with_dependencies(["b"]),
            AgentRecord::new("b").with_dependencies(["a"]),
            AgentRecord::new("x").with_dependencies(["y"]),
            AgentRecord::new("y").with_dependencies(["z"]),
            AgentRecord::new("z").with_dependencies(["x"]),
        ]));

        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec![name("x"), name("y"), name("z"), name("x")]));
    }

    #[test]
    fn test_execution_order_mas() {
        let order = mas().execution_order().unwrap();
        assert_eq!(order, vec![name("M"), name("A"), name("S")]);
    }

    #[test]
    fn test_execution_order_rejects_cycle() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("A").with_dependencies(["B"]),
            AgentRecord::new("B").with_dependencies(["A"]),
        ]));
        match graph.execution_order() {
            Err(GraphError::CycleDetected(cycle)) => {
                assert!(cycle.contains(&name("A")));
                assert!(cycle.contains(&name("B")));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_execution_layers() {
        let layers = mas().execution_layers().unwrap();
        assert_eq!(layers, vec![vec![name("M")], vec![name("A")], vec![name("S")]]);
    }

    #[test]
    fn test_deletion_without_dependents_is_trivial() {
        let plan = mas().analyze_deletion_impact(&name("S"));
        assert!(plan.can_delete_safely);
        assert!(!plan.cascade_deletion_required);
        assert_eq!(plan.deletion_order, vec![name("S")]);
    }

    #[test]
    fn test_deletion_of_root_cascades_dependents_first() {
        let graph = mas();
        let plan = graph.analyze_deletion_impact(&name("M"));

        assert!(!plan.can_delete_safely);
        assert!(plan.cascade_deletion_required);
        assert!(plan.dependent_agents.contains(&name("A")));
        assert!(plan.dependent_agents.contains(&name("S")));
        assert_eq!(plan.deletion_order, vec![name("S"), name("A"), name("M")]);

        for (i, agent) in plan.deletion_order.iter().enumerate() {
            for dep in graph.dependencies_of(agent) {
                let dep_pos = plan.deletion_order.iter().position(|n| n == dep).unwrap();
                assert!(i < dep_pos, "{} must be deleted before {}", agent, dep);
            }
        }
    }

    #[test]
    fn test_deletion_unknown_agent() {
        let plan = mas().analyze_deletion_impact(&name("nobody"));
        assert!(!plan.can_delete_safely);
        assert!(plan.deletion_order.is_empty());
        assert_eq!(plan.warnings, vec!["Agent nobody not found".to_string()]);
    }

    #[test]
    fn test_large_cascade_warns() {
        let mut records = vec![AgentRecord::new("root")];
        for i in 0..6 {
            records.push(AgentRecord::new(format!("w{}", i)).with_dependencies(["root"]));
        }
        let plan = DependencyGraph::build(&snapshot(records)).analyze_deletion_impact(&name("root"));
        assert_eq!(plan.deletion_order.len(), 7);
        assert_eq!(plan.warnings.len(), 1);
        assert_eq!(plan.deletion_order.last(), Some(&name("root")));
    }

    #[test]
    fn test_proposed_cycle_rejected_and_live_graph_unchanged() {
        let graph = mas();
        let before = graph.dependencies_of(&name("A")).to_vec();

        let result = graph.validate_proposed_dependencies(&name("A"), &[name("M"), name("S")]);
        match result {
            Err(GraphError::CircularDependency { agent, cycles }) => {
                assert_eq!(agent, name("A"));
                assert!(cycles
                    .iter()
                    .any(|c| c.contains(&name("A")) && c.contains(&name("S"))));
            }
            other => panic!("expected circular dependency, got {:?}", other),
        }

        assert_eq!(graph.dependencies_of(&name("A")), before.as_slice());
        assert_eq!(graph.dependents_of(&name("S")), &[] as &[AgentName]);
    }

    #[test]
    fn test_proposed_acyclic_change_accepted() {
        let graph = mas();
        assert!(graph
            .validate_proposed_dependencies(&name("S"), &[name("A")])
            .is_ok());
        assert!(graph
            .validate_proposed_dependencies(&name("new"), &[name("S")])
            .is_ok());
    }

    #[test]
    fn test_new_agent_closing_orphaned_reference_rejected() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("a").with_dependencies(["b"])
        ]));
        assert_eq!(graph.orphaned_references().len(), 1);

        let result = graph.validate_proposed_dependencies(&name("b"), &[name("a")]);
        assert!(matches!(result, Err(GraphError::CircularDependency { .. })));
        assert!(graph
            .validate_proposed_dependencies(&name("b"), &[])
            .is_ok());
    }

    #[test]
    fn test_proposed_self_dependency_rejected() {
        let result = mas().validate_proposed_dependencies(&name("A"), &[name("A")]);
        assert!(matches!(result, Err(GraphError::CircularDependency { .. })));
    }

    #[test]
    fn test_chain_depth() {
        let graph = mas();
        assert_eq!(graph.chain_depth(&name("M")), 1);
        assert_eq!(graph.chain_depth(&name("A")), 2);
        assert_eq!(graph.chain_depth(&name("S")), 3);
        assert_eq!(graph.chain_depth(&name("missing")), 0);
    }

    #[test]
    fn test_chain_depth_terminates_on_cycle() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("A").with_dependencies(["B"]),
            AgentRecord::new("B").with_dependencies(["A"]),
        ]));
        assert_eq!(graph.chain_depth(&name("A")), 2);
    }

    #[test]
    fn test_validate_warns_on_long_chain() {
        let mut records = vec![AgentRecord::new("a0")];
        for i in 1..7 {
            records.push(AgentRecord::new(format!("a{}", i)).with_dependencies([format!("a{}", i - 1)]));
        }
        let report = DependencyGraph::build(&snapshot(records)).validate();
        assert!(report.is_valid());
        assert!(report.warnings().iter().any(|w| w.contains("a6")));
    }

    #[test]
    fn test_report_categories() {
        let graph = DependencyGraph::build(&snapshot(vec![
            AgentRecord::new("M"),
            AgentRecord::new("A").with_dependencies(["M"]),
            AgentRecord::new("solo"),
        ]));
        let report = graph.report();

        assert_eq!(report.statistics.total_agents, 3);
        assert_eq!(report.statistics.agents_with_dependencies, 1);
        assert_eq!(report.statistics.agents_with_dependents, 1);
        assert_eq!(report.statistics.longest_chain, 2);
        assert_eq!(report.isolated_agents, vec![name("solo")]);
        assert_eq!(report.root_agents, vec![name("M")]);
        assert_eq!(report.leaf_agents, vec![name("A")]);
    }

    #[test]
    fn test_canonical_cycle_rotation() {
        let cycle = vec![name("c"), name("a"), name("b"), name("c")];
        assert_eq!(
            canonical_cycle(&cycle),
            vec![name("a"), name("b"), name("c"), name("a")]
        );
    }
}
