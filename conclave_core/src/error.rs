//! Error types for ConclaveKit.

use crate::types::AgentName;

/// Errors produced while reasoning about the dependency graph.
///
/// Graph analysis itself never fails on malformed input; these are
/// returned by the operations that must refuse a result (ordering a
/// cyclic graph, accepting a cyclic proposal).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A proposed dependency change would introduce a cycle.
    #[error("Circular dependency introduced by {agent}: {}", format_cycles(.cycles))]
    CircularDependency {
        /// Agent whose dependencies were being changed
        agent: AgentName,
        /// Every cycle found in the hypothetical graph
        cycles: Vec<Vec<AgentName>>,
    },

    /// The graph contains a cycle and cannot be ordered.
    #[error("Cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<AgentName>),
}

/// Errors reported by an [`AgentStore`](crate::store::AgentStore).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with this name exists.
    #[error("Agent record not found: {0}")]
    NotFound(AgentName),

    /// A record with this name already exists.
    #[error("Agent record already exists: {0}")]
    AlreadyExists(AgentName),

    /// The backing storage failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Main error type for ConclaveKit core.
///
/// Plan derivation returns `Result<T> = std::result::Result<T, ConclaveError>`.
/// Store implementations report [`StoreError`] directly.
#[derive(thiserror::Error, Debug)]
pub enum ConclaveError {
    /// Dependency graph error.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Type alias for Result with ConclaveError.
pub type Result<T> = std::result::Result<T, ConclaveError>;

fn format_cycle(cycle: &[AgentName]) -> String {
    cycle
        .iter()
        .map(AgentName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_cycles(cycles: &[Vec<AgentName>]) -> String {
    cycles
        .iter()
        .map(|c| format!("[{}]", format_cycle(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound(AgentName::new("scout"));
        assert_eq!(err.to_string(), "Agent record not found: scout");
    }

    #[test]
    fn test_cycle_display() {
        let err = GraphError::CycleDetected(vec![
            AgentName::new("a"),
            AgentName::new("b"),
            AgentName::new("a"),
        ]);
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> a");
    }

    #[test]
    fn test_graph_error_converts() {
        let err: ConclaveError = GraphError::CycleDetected(vec![AgentName::new("x")]).into();
        assert!(matches!(err, ConclaveError::Graph(GraphError::CycleDetected(_))));
        assert!(err.to_string().starts_with("Graph error: Cycle detected"));
    }
}
