//! Stop requests for running workflow executions.
//!
//! A [`StopSource`] owns the stop signal; [`StopToken`]s are cheap clones
//! handed to the scheduler. The scheduler checks its token at iteration
//! boundaries only, so agents already dispatched in the current iteration
//! always finish.
//!
//! ```ignore
//! let source = StopSource::new();
//! let token = source.token();
//!
//! tokio::spawn(async move { scheduler.run("objective", "thread-1", token).await });
//!
//! source.stop();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread-safe stop token.
///
/// Cloning a token creates a new reference to the same stop state.
#[derive(Clone, Debug)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    fn new() -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token that is never stopped.
    pub fn never() -> Self {
        Self::new()
    }

    /// Returns true once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Owner of a stop signal.
#[derive(Clone, Debug)]
pub struct StopSource {
    token: StopToken,
}

impl StopSource {
    /// Creates a new source in the running state.
    pub fn new() -> Self {
        Self {
            token: StopToken::new(),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    /// Requests a stop. Idempotent.
    pub fn stop(&self) {
        self.token.request();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_stopped()
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}
