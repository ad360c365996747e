//! Mutual exclusion between topology mutation and execution.
//!
//! Worker waves hold a shared guard while their agents run. Lifecycle
//! operations need the exclusive guard and are refused outright while any
//! wave anywhere holds a shared one. Concurrent lifecycle operations queue
//! behind each other instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Returned when a mutation is attempted while agents are running.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Cannot perform agent operations while workflow is running ({running} agents running)")]
pub struct ExecutionInProgress {
    /// Agents running system-wide at the time of the attempt
    pub running: usize,
}

/// Coarse lock shared by every scheduler and lifecycle manager of a system.
#[derive(Clone, Debug, Default)]
pub struct ExecutionGate {
    lock: Arc<RwLock<()>>,
    mutations: Arc<Mutex<()>>,
    running: Arc<AtomicUsize>,
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a worker wave of `agents` concurrently running agents.
    ///
    /// Waits while a lifecycle operation holds the exclusive guard.
    pub async fn enter_wave(&self, agents: usize) -> WaveGuard {
        let guard = Arc::clone(&self.lock).read_owned().await;
        self.running.fetch_add(agents, Ordering::SeqCst);
        WaveGuard {
            _guard: guard,
            running: Arc::clone(&self.running),
            agents,
        }
    }

    /// Takes the exclusive mutation guard.
    ///
    /// Waits for earlier mutations to finish, then fails immediately if a
    /// worker wave is running. Only waves hold the lock in shared mode once
    /// the mutation queue is held, so a failed `try_write` means agents run.
    pub async fn mutation(&self) -> Result<MutationGuard, ExecutionInProgress> {
        let turn = Arc::clone(&self.mutations).lock_owned().await;
        match Arc::clone(&self.lock).try_write_owned() {
            Ok(guard) => Ok(MutationGuard {
                _guard: guard,
                _turn: turn,
            }),
            Err(_) => Err(ExecutionInProgress {
                running: self.running_agents(),
            }),
        }
    }

    /// Number of agents currently running under this gate.
    pub fn running_agents(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.running_agents() > 0
    }
}

/// Shared guard held for the duration of one worker wave.
#[derive(Debug)]
pub struct WaveGuard {
    _guard: OwnedRwLockReadGuard<()>,
    running: Arc<AtomicUsize>,
    agents: usize,
}

impl Drop for WaveGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(self.agents, Ordering::SeqCst);
    }
}

/// Exclusive guard held for the duration of one lifecycle operation.
#[derive(Debug)]
pub struct MutationGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    _turn: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutation_allowed_when_idle() {
        let gate = ExecutionGate::new();
        assert!(gate.mutation().await.is_ok());
    }

    #[tokio::test]
    async fn test_mutation_rejected_during_wave() {
        let gate = ExecutionGate::new();
        let wave = gate.enter_wave(3).await;
        assert_eq!(gate.running_agents(), 3);

        let err = gate.mutation().await.unwrap_err();
        assert_eq!(err.running, 3);
        assert!(err.to_string().contains("while workflow is running"));

        drop(wave);
        assert_eq!(gate.running_agents(), 0);
        assert!(gate.mutation().await.is_ok());
    }

    #[tokio::test]
    async fn test_mutations_queue_behind_each_other() {
        let gate = ExecutionGate::new();
        let first = gate.mutation().await.unwrap();

        let waiting = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.mutation().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        drop(first);
        assert_eq!(waiting.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_waves_share_the_gate() {
        let gate = ExecutionGate::new();
        let first = gate.enter_wave(1).await;
        let second = gate.enter_wave(2).await;
        assert_eq!(gate.running_agents(), 3);
        drop(first);
        drop(second);
        assert!(!gate.is_executing());
    }
}
