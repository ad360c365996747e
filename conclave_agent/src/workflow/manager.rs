//! Background workflow executions.
//!
//! Each execution runs its own scheduler loop on a tokio task with its own
//! [`RunState`]. Executions are addressed by thread id.

use crate::cancellation::{StopSource, StopToken};
use crate::workflow::scheduler::{Scheduler, WorkflowError};
use crate::workflow::state::{RunState, TerminationReason, WorkflowProgress, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

type Outcome = Result<RunState, String>;

/// One tracked execution.
///
/// The task publishes its outcome on `outcome` before it finishes, so any
/// number of waiters can subscribe while `handle` stays in place for
/// liveness checks.
struct Execution {
    stop: StopSource,
    handle: JoinHandle<()>,
    outcome: watch::Receiver<Option<Outcome>>,
    started_at: DateTime<Utc>,
}

impl Execution {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Status report of one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub thread_id: String,
    pub status: WorkflowStatus,
    pub current_iteration: u64,
    pub termination: Option<TerminationReason>,
    pub progress: Option<WorkflowProgress>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One entry of [`ExecutionManager::list`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub thread_id: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
}

/// Starts, tracks and stops workflow executions.
///
/// At most one execution runs per thread id. A thread id can be reused
/// once its previous execution has finished.
#[derive(Clone)]
pub struct ExecutionManager {
    scheduler: Scheduler,
    executions: Arc<Mutex<HashMap<String, Execution>>>,
}

impl ExecutionManager {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts a new execution in the background and returns its thread id.
    pub async fn start(
        &self,
        objective: impl Into<String>,
        thread_id: Option<String>,
    ) -> Result<String, WorkflowError> {
        let thread_id = thread_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let objective = objective.into();
        self.spawn(thread_id, move |scheduler, thread_id, stop| async move {
            scheduler.run(&objective, &thread_id, stop).await
        })
        .await
    }

    /// Resumes an execution from its latest checkpoint in the background.
    pub async fn resume(&self, thread_id: &str) -> Result<String, WorkflowError> {
        self.spawn(thread_id.to_string(), |scheduler, thread_id, stop| async move {
            scheduler.resume(&thread_id, stop).await
        })
        .await
    }

    async fn spawn<F, Fut>(&self, thread_id: String, launch: F) -> Result<String, WorkflowError>
    where
        F: FnOnce(Scheduler, String, StopToken) -> Fut,
        Fut: Future<Output = Result<RunState, WorkflowError>> + Send + 'static,
    {
        let mut executions = self.executions.lock().await;
        if executions.get(&thread_id).is_some_and(Execution::is_running) {
            return Err(WorkflowError::AlreadyRunning(thread_id));
        }

        let stop = StopSource::new();
        let run = launch(self.scheduler.clone(), thread_id.clone(), stop.token());
        let (publish, outcome) = watch::channel(None);
        let handle = tokio::spawn(async move {
            let result = run.await.map_err(|e| e.to_string());
            publish.send_replace(Some(result));
        });
        executions.insert(
            thread_id.clone(),
            Execution {
                stop,
                handle,
                outcome,
                started_at: Utc::now(),
            },
        );
        tracing::info!(thread_id = %thread_id, "execution started");
        Ok(thread_id)
    }

    /// Requests a stop; agents already running finish first.
    pub async fn stop(&self, thread_id: &str) -> Result<(), WorkflowError> {
        let executions = self.executions.lock().await;
        let execution = executions
            .get(thread_id)
            .ok_or_else(|| WorkflowError::ExecutionNotFound(thread_id.to_string()))?;
        execution.stop.stop();
        tracing::info!(thread_id, "stop requested");
        Ok(())
    }

    /// Waits for an execution to terminate and returns its final state.
    ///
    /// Any number of callers may wait on the same execution.
    pub async fn wait(&self, thread_id: &str) -> Result<RunState, WorkflowError> {
        let mut outcome = {
            let executions = self.executions.lock().await;
            executions
                .get(thread_id)
                .ok_or_else(|| WorkflowError::ExecutionNotFound(thread_id.to_string()))?
                .outcome
                .clone()
        };

        // The sender is dropped without a value only if the task panicked.
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(published) => (*published).clone(),
            Err(_) => None,
        };
        match result {
            Some(Ok(state)) => Ok(state),
            Some(Err(message)) => Err(WorkflowError::ExecutionFailed(message)),
            None => Err(WorkflowError::ExecutionFailed(
                "execution task ended without a result".to_string(),
            )),
        }
    }

    /// Reports the status of an execution.
    ///
    /// Finished executions report their final state. Running ones report
    /// the latest checkpoint.
    pub async fn status(&self, thread_id: &str) -> Result<ExecutionStatus, WorkflowError> {
        let (finished, started_at) = {
            let executions = self.executions.lock().await;
            let execution = executions
                .get(thread_id)
                .ok_or_else(|| WorkflowError::ExecutionNotFound(thread_id.to_string()))?;
            (!execution.is_running(), execution.started_at)
        };

        if finished {
            return Ok(match self.wait(thread_id).await {
                Ok(state) => ExecutionStatus {
                    thread_id: thread_id.to_string(),
                    status: state.status,
                    current_iteration: state.current_iteration,
                    termination: state.termination,
                    progress: Some(state.progress()),
                    error: None,
                    started_at,
                },
                Err(e) => ExecutionStatus {
                    thread_id: thread_id.to_string(),
                    status: WorkflowStatus::Failed,
                    current_iteration: 0,
                    termination: None,
                    progress: None,
                    error: Some(e.to_string()),
                    started_at,
                },
            });
        }

        let latest = self.scheduler.checkpoints().latest(thread_id).await?;
        Ok(match latest {
            Some(checkpoint) => ExecutionStatus {
                thread_id: thread_id.to_string(),
                status: WorkflowStatus::Running,
                current_iteration: checkpoint.state.current_iteration,
                termination: None,
                progress: Some(checkpoint.state.progress()),
                error: None,
                started_at,
            },
            None => ExecutionStatus {
                thread_id: thread_id.to_string(),
                status: WorkflowStatus::Running,
                current_iteration: 0,
                termination: None,
                progress: None,
                error: None,
                started_at,
            },
        })
    }

    /// Every known execution, oldest first.
    pub async fn list(&self) -> Vec<ExecutionSummary> {
        let executions = self.executions.lock().await;
        let mut all: Vec<ExecutionSummary> = executions
            .iter()
            .map(|(thread_id, e)| ExecutionSummary {
                thread_id: thread_id.clone(),
                running: e.is_running(),
                started_at: e.started_at,
            })
            .collect();
        all.sort_by_key(|s| s.started_at);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::checkpoint::InMemoryCheckpointStore;
    use crate::workflow::executor::{
        AgentExecutor, AgentOutput, ExecutorError, ExecutorRegistry, FnExecutor, RunContext,
    };
    use async_trait::async_trait;
    use conclave_core::{AgentRecord, InMemoryAgentStore, PlanCache};
    use serde_json::json;

    /// Holds every agent until the channel reads `true`.
    struct HeldExecutor {
        release: watch::Receiver<bool>,
    }

    #[async_trait]
    impl AgentExecutor for HeldExecutor {
        async fn execute(&self, _context: RunContext) -> Result<AgentOutput, ExecutorError> {
            let mut release = self.release.clone();
            let _ = release.wait_for(|open| *open).await;
            Ok(AgentOutput::new(json!("done")))
        }
    }

    fn manager() -> ExecutionManager {
        manager_with(ExecutorRegistry::new().with_fallback(Arc::new(FnExecutor::new(|ctx| {
            Ok(AgentOutput::new(json!({"agent": ctx.agent.as_str()})))
        }))))
    }

    fn manager_with(executors: ExecutorRegistry) -> ExecutionManager {
        let scheduler = Scheduler::new(
            Arc::new(InMemoryAgentStore::with_records([AgentRecord::new("a")])),
            PlanCache::new(),
            executors,
            Arc::new(InMemoryCheckpointStore::new()),
        );
        ExecutionManager::new(scheduler)
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let manager = manager();
        let thread_id = manager.start("objective", None).await.unwrap();
        let state = manager.wait(&thread_id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);

        let status = manager.status(&thread_id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);
        assert!(status.progress.is_some());

        let listed = manager.list().await;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].running);
    }

    #[tokio::test]
    async fn test_waiters_share_one_execution() {
        let (release, held) = watch::channel(false);
        let manager = manager_with(
            ExecutorRegistry::new().with_fallback(Arc::new(HeldExecutor { release: held })),
        );
        let thread_id = manager
            .start("objective", Some("t1".to_string()))
            .await
            .unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                let thread_id = thread_id.clone();
                tokio::spawn(async move { manager.wait(&thread_id).await })
            })
            .collect();
        tokio::task::yield_now().await;

        let listed = manager.list().await;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].running);
        assert!(matches!(
            manager.start("objective", Some("t1".to_string())).await,
            Err(WorkflowError::AlreadyRunning(ref id)) if id == "t1"
        ));
        assert_eq!(
            manager.status(&thread_id).await.unwrap().status,
            WorkflowStatus::Running
        );

        release.send_replace(true);
        for waiter in waiters {
            let state = waiter.await.unwrap().unwrap();
            assert_eq!(state.status, WorkflowStatus::Completed);
        }
        let state = manager.wait(&thread_id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let manager = manager();
        assert!(matches!(
            manager.stop("ghost").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            manager.status("ghost").await,
            Err(WorkflowError::ExecutionNotFound(_))
        ));
    }
}
