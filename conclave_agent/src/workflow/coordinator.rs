//! Coordinator interface.
//!
//! The coordinator assigns tasks before the first worker round and later
//! decides whether the project is complete. The scheduler only asks it to
//! evaluate once the system is stable.

use crate::workflow::state::RunState;
use async_trait::async_trait;
use conclave_core::AgentName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of a coordinator evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDecision {
    pub project_complete: bool,
    /// Replacement tasks for the next iterations
    #[serde(default)]
    pub tasks: BTreeMap<AgentName, String>,
    pub summary: Option<String>,
}

impl CoordinatorDecision {
    pub fn complete() -> Self {
        Self {
            project_complete: true,
            ..Self::default()
        }
    }

    pub fn continue_with(tasks: BTreeMap<AgentName, String>) -> Self {
        Self {
            project_complete: false,
            tasks,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Assigns tasks before the first worker round.
    async fn assign_initial_tasks(
        &self,
        state: &RunState,
    ) -> anyhow::Result<BTreeMap<AgentName, String>>;

    /// Evaluates a stable system.
    async fn evaluate(&self, state: &RunState) -> anyhow::Result<CoordinatorDecision>;
}

/// Default coordinator.
///
/// Gives every agent the objective as its task and declares the project
/// complete as soon as it is asked to evaluate, which only happens once
/// the system is stable.
#[derive(Clone, Copy, Debug, Default)]
pub struct StabilityCoordinator;

#[async_trait]
impl Coordinator for StabilityCoordinator {
    async fn assign_initial_tasks(
        &self,
        state: &RunState,
    ) -> anyhow::Result<BTreeMap<AgentName, String>> {
        Ok(state
            .agents
            .keys()
            .map(|name| (name.clone(), state.objective.clone()))
            .collect())
    }

    async fn evaluate(&self, state: &RunState) -> anyhow::Result<CoordinatorDecision> {
        Ok(CoordinatorDecision::complete().with_summary(format!(
            "Stable after {} iterations",
            state.current_iteration
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::workflow::state::TrackedAgent;

    #[tokio::test]
    async fn test_stability_coordinator_assigns_objective() {
        let mut state = RunState::new("thread-1", "ship it", &SchedulerConfig::default());
        state.agents.insert(AgentName::new("writer"), TrackedAgent::default());

        let tasks = StabilityCoordinator.assign_initial_tasks(&state).await.unwrap();
        assert_eq!(tasks[&AgentName::new("writer")], "ship it");

        let decision = StabilityCoordinator.evaluate(&state).await.unwrap();
        assert!(decision.project_complete);
    }
}
