//! Iterative workflow scheduler.
//!
//! One control loop per execution. Each iteration fetches the current
//! execution plan, runs worker agents in waves as their dependencies
//! produce output, lets the coordinator evaluate once the system is
//! stable, checkpoints the run state and decides whether to stop.
//!
//! # Iteration
//!
//! 1. Stop requests are honored at the iteration boundary.
//! 2. The plan is fetched from the [`PlanCache`]; it is only rebuilt when
//!    the agent set changed.
//! 3. Iteration 0 only: the coordinator assigns initial tasks.
//! 4. Worker round: every ready agent is dispatched concurrently and the
//!    whole wave is joined before readiness is recomputed. Each agent runs
//!    at most once per iteration.
//! 5. From iteration 1 on, the coordinator evaluates only a stable system.
//! 6. Termination is decided, the iteration advances and a checkpoint is
//!    saved.

use crate::audit::{AuditEvent, AuditLog};
use crate::cancellation::StopToken;
use crate::config::{ConfigError, SchedulerConfig};
use crate::gate::ExecutionGate;
use crate::workflow::checkpoint::{CheckpointError, CheckpointStore, RunCheckpoint};
use crate::workflow::coordinator::{Coordinator, StabilityCoordinator};
use crate::workflow::executor::{ExecutorError, ExecutorRegistry, RunContext};
use crate::workflow::state::{RunState, TerminationReason, WorkflowStatus};
use chrono::Utc;
use conclave_core::{
    AgentName, AgentSnapshot, AgentStore, ConclaveError, ExecutionPlan, PlanCache, StoreError,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error types for workflow execution.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Agent store error: {0}")]
    Store(#[from] StoreError),

    /// The execution plan could not be derived
    #[error("Plan error: {0}")]
    Plan(#[from] ConclaveError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resume requested for a thread without checkpoints
    #[error("No checkpoint found for thread {0}")]
    NoCheckpoint(String),

    /// Resume requested for a thread that already finished
    #[error("Execution {thread_id} already {status}")]
    AlreadyTerminated {
        thread_id: String,
        status: WorkflowStatus,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution already running: {0}")]
    AlreadyRunning(String),

    /// The background task of an execution failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// What one worker round did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub executed: Vec<AgentName>,
    pub changed: Vec<AgentName>,
    pub errors: usize,
    pub waves: usize,
}

/// Drives workflow executions.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn AgentStore>,
    plans: PlanCache,
    executors: ExecutorRegistry,
    coordinator: Arc<dyn Coordinator>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: SchedulerConfig,
    gate: ExecutionGate,
    audit: Option<AuditLog>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn AgentStore>,
        plans: PlanCache,
        executors: ExecutorRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            store,
            plans,
            executors,
            coordinator: Arc::new(StabilityCoordinator),
            checkpoints,
            config: SchedulerConfig::default(),
            gate: ExecutionGate::new(),
            audit: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares the execution gate with lifecycle operations.
    pub fn with_gate(mut self, gate: ExecutionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record_or_warn(event).await;
        }
    }

    /// Runs a new execution to termination.
    pub async fn run(
        &self,
        objective: &str,
        thread_id: &str,
        stop: StopToken,
    ) -> Result<RunState, WorkflowError> {
        self.config.validate()?;
        let state = RunState::new(thread_id, objective, &self.config);
        self.drive(state, stop).await
    }

    /// Continues an execution from its latest checkpoint.
    pub async fn resume(&self, thread_id: &str, stop: StopToken) -> Result<RunState, WorkflowError> {
        self.config.validate()?;
        let checkpoint = self
            .checkpoints
            .latest(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::NoCheckpoint(thread_id.to_string()))?;
        checkpoint.validate()?;

        let state = checkpoint.state;
        if matches!(state.status, WorkflowStatus::Completed | WorkflowStatus::Failed) {
            return Err(WorkflowError::AlreadyTerminated {
                thread_id: thread_id.to_string(),
                status: state.status,
            });
        }
        info!(
            thread_id,
            iteration = state.current_iteration,
            checkpoint = checkpoint.iteration,
            "resuming execution from checkpoint"
        );
        self.drive(state, stop).await
    }

    async fn drive(&self, mut state: RunState, stop: StopToken) -> Result<RunState, WorkflowError> {
        state.status = WorkflowStatus::Running;
        state.termination = None;
        info!(
            thread_id = %state.thread_id,
            iteration = state.current_iteration,
            max_iterations = state.max_iterations,
            "workflow execution started"
        );
        self.audit(AuditEvent::WorkflowStarted {
            timestamp: Utc::now(),
            thread_id: state.thread_id.clone(),
            iteration: state.current_iteration,
            agent_count: state.agents.len(),
        })
        .await;

        loop {
            if stop.is_stopped() {
                info!(thread_id = %state.thread_id, iteration = state.current_iteration, "stop requested");
                state.terminate(WorkflowStatus::Stopped, TerminationReason::StopRequested);
                break;
            }
            self.run_iteration(&mut state).await?;
            if state.status.is_terminal() {
                break;
            }
        }

        let reason = state
            .termination
            .map(|r| r.to_string())
            .unwrap_or_default();
        info!(
            thread_id = %state.thread_id,
            status = %state.status,
            reason = %reason,
            iterations = state.current_iteration,
            "workflow execution terminated"
        );
        self.audit(AuditEvent::WorkflowTerminated {
            timestamp: Utc::now(),
            thread_id: state.thread_id.clone(),
            status: state.status.to_string(),
            reason,
        })
        .await;
        Ok(state)
    }

    async fn run_iteration(&self, state: &mut RunState) -> Result<(), WorkflowError> {
        let iteration = state.current_iteration;
        let snapshot = self.store.snapshot().await?;
        let plan = self.plans.get_or_build(&snapshot).await?;
        state.plan_version = Some(plan.version);

        let (added, removed) = state.sync_agents(&plan);
        if !added.is_empty() || !removed.is_empty() {
            info!(
                thread_id = %state.thread_id,
                iteration,
                added = ?added,
                removed = ?removed,
                plan_version = plan.version,
                "agent set changed"
            );
        }
        state.begin_iteration();

        if iteration == 0 && state.tasks.is_empty() {
            match self.coordinator.assign_initial_tasks(state).await {
                Ok(tasks) => state.tasks.extend(tasks),
                Err(e) => warn!(thread_id = %state.thread_id, error = %e, "initial task assignment failed"),
            }
        }

        let round = self.worker_round(state, &plan, &snapshot).await;
        debug!(
            thread_id = %state.thread_id,
            iteration,
            executed = round.executed.len(),
            changed = round.changed.len(),
            errors = round.errors,
            waves = round.waves,
            "worker round finished"
        );

        if iteration > 0 {
            if state.is_stable() {
                match self.coordinator.evaluate(state).await {
                    Ok(decision) => {
                        if let Some(summary) = &decision.summary {
                            info!(thread_id = %state.thread_id, iteration, summary = %summary, "coordinator evaluated");
                        }
                        state.tasks.extend(decision.tasks);
                        state.project_complete = decision.project_complete;
                    }
                    Err(e) => warn!(thread_id = %state.thread_id, error = %e, "coordinator evaluation failed"),
                }
            } else {
                debug!(thread_id = %state.thread_id, iteration, "system not stable, coordinator skipped");
            }
        }

        self.audit(AuditEvent::IterationCompleted {
            timestamp: Utc::now(),
            thread_id: state.thread_id.clone(),
            iteration,
            executed: round.executed.iter().map(|n| n.to_string()).collect(),
            changed: round.changed.iter().map(|n| n.to_string()).collect(),
            errors: round.errors,
        })
        .await;

        if state.project_complete {
            state.terminate(WorkflowStatus::Completed, TerminationReason::CoordinatorComplete);
        } else if state.error_threshold_exceeded() {
            warn!(
                thread_id = %state.thread_id,
                iteration,
                errors = state.error_count(),
                agents = state.agents.len(),
                "error threshold exceeded"
            );
            state.terminate(WorkflowStatus::Failed, TerminationReason::ErrorThreshold);
        } else {
            state.current_iteration += 1;
            if state.current_iteration >= state.max_iterations {
                state.terminate(WorkflowStatus::Completed, TerminationReason::IterationCap);
            }
        }

        let checkpoint = RunCheckpoint::capture(state, iteration)?;
        self.checkpoints.save(&checkpoint).await?;
        Ok(())
    }

    /// Runs waves of ready agents until nothing more becomes ready.
    async fn worker_round(
        &self,
        state: &mut RunState,
        plan: &ExecutionPlan,
        snapshot: &AgentSnapshot,
    ) -> RoundSummary {
        let mut round = RoundSummary::default();
        let mut attempted: HashSet<AgentName> = HashSet::new();
        let mut empty_attempts = 0;

        while attempted.len() < state.agents.len() {
            let ready = state.ready_agents(plan, &attempted);
            if ready.is_empty() {
                empty_attempts += 1;
                if empty_attempts >= self.config.ready_retry_limit {
                    debug!(
                        thread_id = %state.thread_id,
                        iteration = state.current_iteration,
                        waiting = state.agents.len() - attempted.len(),
                        "no agent became ready, ending worker round"
                    );
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }
            empty_attempts = 0;
            attempted.extend(ready.iter().cloned());
            self.run_wave(state, plan, snapshot, ready, &mut round).await;
            round.waves += 1;
        }
        round
    }

    /// Dispatches one wave concurrently and joins every agent in it.
    async fn run_wave(
        &self,
        state: &mut RunState,
        plan: &ExecutionPlan,
        snapshot: &AgentSnapshot,
        wave: Vec<AgentName>,
        round: &mut RoundSummary,
    ) {
        let _guard = self.gate.enter_wave(wave.len()).await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_agents));
        let timeout = self.config.agent_timeout();
        let mut tasks = JoinSet::new();

        for agent in &wave {
            state.mark_running(agent);
            let context = self.context_for(state, plan, snapshot, agent);
            let executor = self.executors.get(agent);
            let semaphore = Arc::clone(&semaphore);
            let agent = agent.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = match executor {
                    None => Err(ExecutorError::NotRegistered(agent.clone())),
                    Some(executor) => match timeout {
                        Some(limit) => tokio::time::timeout(limit, executor.execute(context))
                            .await
                            .unwrap_or(Err(ExecutorError::TimedOut(limit))),
                        None => executor.execute(context).await,
                    },
                };
                (agent, result)
            });
        }

        let mut finished = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let (agent, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(thread_id = %state.thread_id, error = %e, "agent task did not complete");
                    continue;
                }
            };
            finished.insert(agent.clone());
            round.executed.push(agent.clone());

            match result {
                Ok(output) => {
                    if state.record_output(&agent, output) {
                        round.changed.push(agent);
                    }
                }
                Err(e) => {
                    warn!(
                        thread_id = %state.thread_id,
                        iteration = state.current_iteration,
                        agent = %agent,
                        error = %e,
                        "agent failed"
                    );
                    self.audit(AuditEvent::AgentFailed {
                        timestamp: Utc::now(),
                        thread_id: state.thread_id.clone(),
                        iteration: state.current_iteration,
                        agent: agent.to_string(),
                        error: e.to_string(),
                    })
                    .await;
                    state.record_error(&agent, e.to_string());
                    round.errors += 1;
                }
            }
        }

        for agent in wave.iter().filter(|a| !finished.contains(*a)) {
            let error = ExecutorError::Aborted("no result returned".to_string());
            state.record_error(agent, error.to_string());
            round.errors += 1;
        }
    }

    fn context_for(
        &self,
        state: &RunState,
        plan: &ExecutionPlan,
        snapshot: &AgentSnapshot,
        agent: &AgentName,
    ) -> RunContext {
        let iteration = state.current_iteration;
        let dependency_outputs = plan
            .dependencies_of(agent)
            .iter()
            .filter_map(|dep| {
                state
                    .latest_output_at(dep, iteration)
                    .map(|o| (dep.clone(), o.content.clone()))
            })
            .collect();

        RunContext {
            agent: agent.clone(),
            record: snapshot.get(agent).cloned(),
            thread_id: state.thread_id.clone(),
            iteration,
            objective: state.objective.clone(),
            task: state.tasks.get(agent).cloned(),
            dependency_outputs,
            previous_output: state
                .previous_output(agent, iteration)
                .map(|o| o.content.clone()),
            messages: state.messages_for(agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::StopSource;
    use crate::workflow::checkpoint::InMemoryCheckpointStore;
    use crate::workflow::executor::{AgentOutput, FnExecutor};
    use conclave_core::{AgentRecord, InMemoryAgentStore};
    use serde_json::json;

    fn scheduler(records: Vec<AgentRecord>, executors: ExecutorRegistry) -> Scheduler {
        Scheduler::new(
            Arc::new(InMemoryAgentStore::with_records(records)),
            PlanCache::new(),
            executors,
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    fn constant() -> ExecutorRegistry {
        ExecutorRegistry::new().with_fallback(Arc::new(FnExecutor::new(|_| {
            Ok(AgentOutput::new(json!({"answer": 42})))
        })))
    }

    #[tokio::test]
    async fn test_converges_with_default_coordinator() {
        let scheduler = scheduler(
            vec![
                AgentRecord::new("coordinator"),
                AgentRecord::new("a"),
                AgentRecord::new("b").with_dependencies(["a"]),
            ],
            constant(),
        )
        .with_config(SchedulerConfig::default().with_stability_threshold(2));

        let state = scheduler
            .run("objective", "thread-1", StopToken::never())
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.termination, Some(TerminationReason::CoordinatorComplete));
        // Outputs settle at iteration 0; stable once iteration 2 is reached.
        assert_eq!(state.current_iteration, 2);
        assert!(!state.agents.contains_key(&AgentName::new("coordinator")));
    }

    #[tokio::test]
    async fn test_stop_before_first_iteration() {
        let scheduler = scheduler(vec![AgentRecord::new("a")], constant());
        let source = StopSource::new();
        source.stop();

        let state = scheduler.run("objective", "thread-1", source.token()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Stopped);
        assert!(state.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_executor_counts_as_error() {
        let scheduler = scheduler(vec![AgentRecord::new("a")], ExecutorRegistry::new());
        let state = scheduler
            .run("objective", "thread-1", StopToken::never())
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.termination, Some(TerminationReason::ErrorThreshold));
    }
}
