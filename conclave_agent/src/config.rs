//! Runtime configuration loaded from YAML.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```yaml
//! scheduler:
//!   max_iterations: 20
//!   stability_threshold: 2
//! audit_dir: .conclave/audit
//! ```

use crate::audit::AuditLog;
use conclave_core::{GraphLimits, PlanCache};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error types for configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML could not be parsed
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduler limits and convergence parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard cap on iterations per execution
    pub max_iterations: u64,
    /// Quiet iterations required before the system counts as stable
    pub stability_threshold: u64,
    /// Consecutive empty ready-set computations tolerated within one iteration
    pub ready_retry_limit: u32,
    /// Upper bound on agents running at once within a wave
    pub max_concurrent_agents: usize,
    /// Per-agent execution time limit in milliseconds
    pub agent_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            stability_threshold: 3,
            ready_retry_limit: 3,
            max_concurrent_agents: 8,
            agent_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_stability_threshold(mut self, threshold: u64) -> Self {
        self.stability_threshold = threshold;
        self
    }

    pub fn with_ready_retry_limit(mut self, limit: u32) -> Self {
        self.ready_retry_limit = limit;
        self
    }

    pub fn with_max_concurrent_agents(mut self, limit: usize) -> Self {
        self.max_concurrent_agents = limit;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Returns the per-agent timeout, if configured.
    pub fn agent_timeout(&self) -> Option<Duration> {
        self.agent_timeout_ms.map(Duration::from_millis)
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.ready_retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "ready_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_agents == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_agents must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub scheduler: SchedulerConfig,
    pub graph: GraphLimits,
    /// Directory for persisted audit trails; audit stays in memory when unset
    pub audit_dir: Option<PathBuf>,
}

impl ConclaveConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ConclaveConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()
    }

    /// An empty plan cache applying the configured graph limits.
    pub fn plan_cache(&self) -> PlanCache {
        PlanCache::with_limits(self.graph)
    }

    /// An audit log, persisted under `audit_dir` when one is set.
    pub fn audit_log(&self) -> AuditLog {
        match &self.audit_dir {
            Some(dir) => AuditLog::with_dir(dir.clone()),
            None => AuditLog::new(),
        }
    }

    /// Loads and validates a YAML file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }
}
