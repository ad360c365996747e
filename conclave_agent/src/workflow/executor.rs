//! Agent executors and their registry.
//!
//! The scheduler never knows how an agent does its work. It builds a
//! [`RunContext`] and hands it to the [`AgentExecutor`] registered under
//! the agent's name.

use async_trait::async_trait;
use conclave_core::{AgentName, AgentRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::workflow::state::AgentMessage;

/// Per-agent execution failure. Never fails other agents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor reported a failure
    #[error("Agent failed: {0}")]
    Failed(String),

    /// No executor registered and no fallback configured
    #[error("No executor registered for agent {0}")]
    NotRegistered(AgentName),

    /// The agent exceeded its time limit
    #[error("Agent timed out after {0:?}")]
    TimedOut(Duration),

    /// The agent's task ended without producing a result
    #[error("Agent task aborted: {0}")]
    Aborted(String),
}

impl From<anyhow::Error> for ExecutorError {
    fn from(err: anyhow::Error) -> Self {
        ExecutorError::Failed(format!("{:#}", err))
    }
}

/// A message an agent wants delivered to another agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: AgentName,
    pub content: String,
}

/// Structured output of one agent run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub content: serde_json::Value,
    #[serde(default)]
    pub messages: Vec<OutgoingMessage>,
}

impl AgentOutput {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            messages: Vec::new(),
        }
    }

    /// Adds a message for another agent.
    pub fn with_message(mut self, to: impl Into<AgentName>, content: impl Into<String>) -> Self {
        self.messages.push(OutgoingMessage {
            to: to.into(),
            content: content.into(),
        });
        self
    }
}

/// Everything an agent sees when it runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub agent: AgentName,
    /// Store record of the agent at the start of the iteration
    pub record: Option<AgentRecord>,
    pub thread_id: String,
    pub iteration: u64,
    pub objective: String,
    /// Task assigned by the coordinator, if any
    pub task: Option<String>,
    /// Latest output of each dependency
    pub dependency_outputs: BTreeMap<AgentName, serde_json::Value>,
    /// The agent's own latest output from an earlier iteration
    pub previous_output: Option<serde_json::Value>,
    /// Messages sent by or to the agent, oldest first
    pub messages: Vec<AgentMessage>,
}

/// Runs one agent for one iteration.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, context: RunContext) -> Result<AgentOutput, ExecutorError>;
}

/// Executor backed by a plain function.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(RunContext) -> Result<AgentOutput, ExecutorError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> AgentExecutor for FnExecutor<F>
where
    F: Fn(RunContext) -> Result<AgentOutput, ExecutorError> + Send + Sync,
{
    async fn execute(&self, context: RunContext) -> Result<AgentOutput, ExecutorError> {
        (self.f)(context)
    }
}

/// Explicit mapping from agent name to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentName, Arc<dyn AgentExecutor>>,
    fallback: Option<Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, replacing any previous one for the agent.
    pub fn register(&mut self, agent: impl Into<AgentName>, executor: Arc<dyn AgentExecutor>) {
        self.executors.insert(agent.into(), executor);
    }

    pub fn with_executor(
        mut self,
        agent: impl Into<AgentName>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        self.register(agent, executor);
        self
    }

    /// Executor used for agents without a registered executor.
    pub fn with_fallback(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn get(&self, agent: &AgentName) -> Option<Arc<dyn AgentExecutor>> {
        self.executors
            .get(agent)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn contains(&self, agent: &AgentName) -> bool {
        self.executors.contains_key(agent)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(agent: &str) -> RunContext {
        RunContext {
            agent: AgentName::new(agent),
            record: None,
            thread_id: "thread-1".to_string(),
            iteration: 0,
            objective: "write a report".to_string(),
            task: None,
            dependency_outputs: BTreeMap::new(),
            previous_output: None,
            messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_registry_prefers_registered_executor() {
        let named: Arc<dyn AgentExecutor> =
            Arc::new(FnExecutor::new(|_| Ok(AgentOutput::new(json!("named")))));
        let fallback: Arc<dyn AgentExecutor> =
            Arc::new(FnExecutor::new(|_| Ok(AgentOutput::new(json!("fallback")))));
        let registry = ExecutorRegistry::new()
            .with_executor("writer", named)
            .with_fallback(fallback);

        let writer = registry.get(&AgentName::new("writer")).unwrap();
        assert_eq!(writer.execute(context("writer")).await.unwrap().content, json!("named"));

        let other = registry.get(&AgentName::new("critic")).unwrap();
        assert_eq!(other.execute(context("critic")).await.unwrap().content, json!("fallback"));
        assert!(!registry.contains(&AgentName::new("critic")));
    }

    #[test]
    fn test_missing_executor() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get(&AgentName::new("writer")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: ExecutorError = anyhow::anyhow!("model unavailable").into();
        assert_eq!(err, ExecutorError::Failed("model unavailable".to_string()));
    }
}
