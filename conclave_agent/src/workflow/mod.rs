//! Iterative workflow scheduling.
//!
//! A workflow runs every non-coordinator agent once per iteration, in
//! dependency order, until the coordinator declares the project complete,
//! the iteration cap is reached, too many agents fail or a stop is
//! requested. State is checkpointed after every iteration so a run can be
//! resumed.
//!
//! # Example
//!
//! ```rust,no_run
//! use conclave_agent::cancellation::StopToken;
//! use conclave_agent::workflow::{
//!     AgentOutput, ExecutorRegistry, FnExecutor, InMemoryCheckpointStore, Scheduler,
//! };
//! use conclave_core::{AgentRecord, InMemoryAgentStore, PlanCache};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryAgentStore::with_records([
//!     AgentRecord::new("market"),
//!     AgentRecord::new("analyst").with_dependencies(["market"]),
//! ]);
//! let executors = ExecutorRegistry::new().with_fallback(Arc::new(FnExecutor::new(|ctx| {
//!     Ok(AgentOutput::new(serde_json::json!({ "agent": ctx.agent.as_str() })))
//! })));
//!
//! let scheduler = Scheduler::new(
//!     Arc::new(store),
//!     PlanCache::new(),
//!     executors,
//!     Arc::new(InMemoryCheckpointStore::new()),
//! );
//! let state = scheduler.run("quarterly report", "thread-1", StopToken::never()).await?;
//! println!("{} after {} iterations", state.status, state.current_iteration);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod coordinator;
pub mod executor;
pub mod manager;
pub mod scheduler;
pub mod state;

pub use checkpoint::{
    CheckpointError, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RunCheckpoint,
};
pub use coordinator::{Coordinator, CoordinatorDecision, StabilityCoordinator};
pub use executor::{
    AgentExecutor, AgentOutput, ExecutorError, ExecutorRegistry, FnExecutor, OutgoingMessage,
    RunContext,
};
pub use manager::{ExecutionManager, ExecutionStatus, ExecutionSummary};
pub use scheduler::{RoundSummary, Scheduler, WorkflowError};
pub use state::{
    AgentMessage, AgentRunStatus, IterationSummary, RunState, StoredOutput, TerminationReason,
    TrackedAgent, WorkflowProgress, WorkflowStatus,
};
