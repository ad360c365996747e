//! Per-execution run state.
//!
//! A [`RunState`] belongs to exactly one execution. It records every agent
//! output by iteration, the messages agents exchanged, and the convergence
//! bookkeeping the scheduler uses to decide when the coordinator may
//! evaluate.

use crate::config::SchedulerConfig;
use crate::workflow::executor::{AgentOutput, OutgoingMessage};
use chrono::{DateTime, Utc};
use conclave_core::{AgentName, ExecutionPlan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Top-level keys ignored when comparing two outputs of the same agent.
const VOLATILE_OUTPUT_KEYS: [&str; 3] = ["iteration", "timestamp", "messages"];

/// Status of a workflow execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet started
    Pending,
    /// Iterating
    Running,
    /// Coordinator declared completion or the iteration cap was reached
    Completed,
    /// Too many agents errored
    Failed,
    /// Stopped on request at an iteration boundary
    Stopped,
}

impl WorkflowStatus {
    /// Returns true for states a workflow never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Stopped
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Why an execution ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    CoordinatorComplete,
    IterationCap,
    ErrorThreshold,
    StopRequested,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::CoordinatorComplete => "coordinator declared the project complete",
            TerminationReason::IterationCap => "iteration cap reached",
            TerminationReason::ErrorThreshold => "more than half of the agents errored",
            TerminationReason::StopRequested => "stop requested",
        };
        write!(f, "{}", s)
    }
}

/// Execution status of one agent within the current iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "message")]
pub enum AgentRunStatus {
    #[default]
    Ready,
    Running,
    Completed,
    Error(String),
}

impl AgentRunStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, AgentRunStatus::Error(_))
    }
}

/// Convergence bookkeeping for a tracked agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAgent {
    /// Last iteration in which the agent's output changed materially
    pub last_update_iteration: Option<u64>,
    pub status: AgentRunStatus,
}

/// One stored output of an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub content: serde_json::Value,
}

/// A message delivered between agents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: AgentName,
    pub to: AgentName,
    pub content: String,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
}

/// What happened in one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u64,
    pub agents_executed: Vec<AgentName>,
    pub messages_sent: usize,
    /// `agent: error` entries for agents currently in error
    pub errors: Vec<String>,
}

/// Overall progress of an execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub current_iteration: u64,
    pub max_iterations: u64,
    pub total_agents: usize,
    pub completed_agents: usize,
    pub active_agents: usize,
    pub error_agents: usize,
    pub progress_percentage: f64,
    pub is_stable: bool,
    pub is_complete: bool,
}

/// State of one workflow execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub thread_id: String,
    pub objective: String,
    pub status: WorkflowStatus,
    pub current_iteration: u64,
    pub max_iterations: u64,
    pub stability_threshold: u64,
    /// Worker agents tracked for readiness and stability
    pub agents: BTreeMap<AgentName, TrackedAgent>,
    /// Outputs per agent, oldest first
    pub outputs: BTreeMap<AgentName, Vec<StoredOutput>>,
    /// Current task per agent, as assigned by the coordinator
    pub tasks: BTreeMap<AgentName, String>,
    pub messages: Vec<AgentMessage>,
    pub project_complete: bool,
    pub termination: Option<TerminationReason>,
    /// Version of the execution plan used by the latest iteration
    pub plan_version: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        thread_id: impl Into<String>,
        objective: impl Into<String>,
        config: &SchedulerConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            objective: objective.into(),
            status: WorkflowStatus::Pending,
            current_iteration: 0,
            max_iterations: config.max_iterations,
            stability_threshold: config.stability_threshold,
            agents: BTreeMap::new(),
            outputs: BTreeMap::new(),
            tasks: BTreeMap::new(),
            messages: Vec::new(),
            project_complete: false,
            termination: None,
            plan_version: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Reconciles tracked agents with a plan.
    ///
    /// Every plan agent except the coordinator is tracked. Returns the agents
    /// added and removed. Outputs of removed agents are kept as history.
    pub fn sync_agents(&mut self, plan: &ExecutionPlan) -> (Vec<AgentName>, Vec<AgentName>) {
        let workers: Vec<&AgentName> = plan.order.iter().filter(|n| !n.is_coordinator()).collect();

        let removed: Vec<AgentName> = self
            .agents
            .keys()
            .filter(|name| !workers.contains(name))
            .cloned()
            .collect();
        for name in &removed {
            self.agents.remove(name);
        }

        let mut added = Vec::new();
        for name in workers {
            if !self.agents.contains_key(name) {
                self.agents.insert(name.clone(), TrackedAgent::default());
                added.push(name.clone());
            }
        }
        (added, removed)
    }

    /// Resets per-iteration agent statuses.
    pub fn begin_iteration(&mut self) {
        for tracked in self.agents.values_mut() {
            tracked.status = AgentRunStatus::Ready;
        }
        self.updated_at = Utc::now();
    }

    /// True if `agent` has an output from the current or an earlier iteration.
    pub fn has_output(&self, agent: &AgentName) -> bool {
        self.latest_output_at(agent, self.current_iteration).is_some()
    }

    /// Latest output of `agent` from iteration `iteration` or earlier.
    pub fn latest_output_at(&self, agent: &AgentName, iteration: u64) -> Option<&StoredOutput> {
        self.outputs
            .get(agent)?
            .iter()
            .rev()
            .find(|o| o.iteration <= iteration)
    }

    /// Latest output of `agent` from before `iteration`.
    pub fn previous_output(&self, agent: &AgentName, iteration: u64) -> Option<&StoredOutput> {
        self.outputs
            .get(agent)?
            .iter()
            .rev()
            .find(|o| o.iteration < iteration)
    }

    /// Tracked agents whose dependencies all have outputs and that have not
    /// been attempted yet this iteration, in plan order. The coordinator
    /// produces no worker output, so depending on it never blocks.
    pub fn ready_agents(
        &self,
        plan: &ExecutionPlan,
        attempted: &HashSet<AgentName>,
    ) -> Vec<AgentName> {
        plan.order
            .iter()
            .filter(|name| self.agents.contains_key(*name) && !attempted.contains(*name))
            .filter(|name| {
                plan.dependencies_of(name).iter().all(|dep| {
                    let ready = dep.is_coordinator() || self.has_output(dep);
                    if !ready {
                        tracing::debug!(agent = %name, dependency = %dep, "dependency not ready");
                    }
                    ready
                })
            })
            .cloned()
            .collect()
    }

    pub fn mark_running(&mut self, agent: &AgentName) {
        self.agents.entry(agent.clone()).or_default().status = AgentRunStatus::Running;
    }

    /// Stores an agent output for the current iteration and delivers its
    /// messages.
    ///
    /// Returns true if the output differs materially from the agent's
    /// previous output, in which case `last_update_iteration` advances.
    pub fn record_output(&mut self, agent: &AgentName, output: AgentOutput) -> bool {
        let iteration = self.current_iteration;
        let now = Utc::now();
        let changed = match self.previous_output(agent, iteration) {
            Some(previous) => material(&previous.content) != material(&output.content),
            None => true,
        };

        let AgentOutput { content, messages } = output;
        self.outputs
            .entry(agent.clone())
            .or_default()
            .push(StoredOutput {
                iteration,
                timestamp: now,
                content,
            });
        for OutgoingMessage { to, content } in messages {
            self.messages.push(AgentMessage {
                from: agent.clone(),
                to,
                content,
                iteration,
                timestamp: now,
            });
        }

        let tracked = self.agents.entry(agent.clone()).or_default();
        tracked.status = AgentRunStatus::Completed;
        if changed {
            tracked.last_update_iteration = Some(iteration);
        }
        self.updated_at = now;
        changed
    }

    /// Marks an agent as errored for the current iteration.
    pub fn record_error(&mut self, agent: &AgentName, error: impl Into<String>) {
        self.agents.entry(agent.clone()).or_default().status = AgentRunStatus::Error(error.into());
        self.updated_at = Utc::now();
    }

    /// Every message sent by or to `agent`, oldest first.
    pub fn messages_for(&self, agent: &AgentName) -> Vec<AgentMessage> {
        self.messages
            .iter()
            .filter(|m| &m.from == agent || &m.to == agent)
            .cloned()
            .collect()
    }

    /// Messages exchanged between two agents, in either direction.
    pub fn conversation(&self, a: &AgentName, b: &AgentName) -> Vec<&AgentMessage> {
        self.messages
            .iter()
            .filter(|m| (&m.from == a && &m.to == b) || (&m.from == b && &m.to == a))
            .collect()
    }

    /// True once no tracked agent has changed for `stability_threshold`
    /// iterations. Agents that never changed count as quiet.
    pub fn is_stable(&self) -> bool {
        if self.current_iteration < self.stability_threshold {
            return false;
        }
        self.agents.values().all(|tracked| match tracked.last_update_iteration {
            Some(last) => self.current_iteration.saturating_sub(last) >= self.stability_threshold,
            None => true,
        })
    }

    pub fn error_count(&self) -> usize {
        self.agents.values().filter(|a| a.status.is_error()).count()
    }

    /// True if more than half of the tracked agents are in error.
    pub fn error_threshold_exceeded(&self) -> bool {
        !self.agents.is_empty() && self.error_count() * 2 > self.agents.len()
    }

    pub fn iteration_summary(&self, iteration: u64) -> IterationSummary {
        let agents_executed = self
            .outputs
            .iter()
            .filter(|(_, outputs)| outputs.iter().any(|o| o.iteration == iteration))
            .map(|(name, _)| name.clone())
            .collect();
        let errors = self
            .agents
            .iter()
            .filter_map(|(name, tracked)| match &tracked.status {
                AgentRunStatus::Error(e) => Some(format!("{}: {}", name, e)),
                _ => None,
            })
            .collect();
        IterationSummary {
            iteration,
            agents_executed,
            messages_sent: self.messages.iter().filter(|m| m.iteration == iteration).count(),
            errors,
        }
    }

    pub fn progress(&self) -> WorkflowProgress {
        let total_agents = self.agents.len();
        let count = |pred: fn(&AgentRunStatus) -> bool| {
            self.agents.values().filter(|a| pred(&a.status)).count()
        };
        let completed_agents = count(|s| *s == AgentRunStatus::Completed);
        let progress_percentage = if total_agents > 0 {
            completed_agents as f64 / total_agents as f64 * 100.0
        } else {
            0.0
        };
        WorkflowProgress {
            current_iteration: self.current_iteration,
            max_iterations: self.max_iterations,
            total_agents,
            completed_agents,
            active_agents: count(|s| *s == AgentRunStatus::Running),
            error_agents: count(AgentRunStatus::is_error),
            progress_percentage,
            is_stable: self.is_stable(),
            is_complete: self.project_complete,
        }
    }

    /// Moves to a terminal status.
    pub fn terminate(&mut self, status: WorkflowStatus, reason: TerminationReason) {
        self.status = status;
        self.termination = Some(reason);
        self.updated_at = Utc::now();
    }
}

fn material(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            for key in VOLATILE_OUTPUT_KEYS {
                map.remove(key);
            }
            serde_json::Value::Object(map)
        }
        other => other.clone(),
    }
}
