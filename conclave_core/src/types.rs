//! Core types for ConclaveKit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name reserved for the coordinating agent.
///
/// The coordinator is never allowed to declare dependencies of its own.
pub const COORDINATOR_AGENT: &str = "coordinator";

/// Unique, immutable agent identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    /// Creates a new agent name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the name, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns true if this is the reserved coordinator name (case-insensitive).
    pub fn is_coordinator(&self) -> bool {
        self.0.eq_ignore_ascii_case(COORDINATOR_AGENT)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AgentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of an agent record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered and idle
    #[default]
    Inactive,
    /// Currently participating in an execution
    Running,
    /// Last lifecycle or execution attempt failed
    Error,
    /// Being created or reconfigured
    Configuring,
}

impl AgentStatus {
    /// Returns true if agents with this status take part in the dependency graph.
    pub fn is_graph_eligible(&self) -> bool {
        matches!(self, AgentStatus::Inactive | AgentStatus::Running)
    }
}

/// Durable executable definition produced for an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionArtifacts {
    /// Location of the generated definition
    pub location: String,
    /// Monotonic revision, bumped on every regeneration
    pub revision: u32,
    /// Supporting files bundled with the definition
    pub files: Vec<String>,
}

/// Persistent record describing one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: AgentName,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub dependencies: Vec<AgentName>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub artifacts: Option<DefinitionArtifacts>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentRecord {
    /// Creates an inactive record with no dependencies.
    pub fn new(name: impl Into<AgentName>) -> Self {
        let name = name.into();
        Self {
            display_name: name.to_string(),
            name,
            role: String::new(),
            dependencies: Vec::new(),
            status: AgentStatus::Inactive,
            artifacts: None,
            config: serde_json::Value::Null,
        }
    }

    /// Sets the declared dependencies.
    pub fn with_dependencies<I, N>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<AgentName>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the record status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the role description.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Sets the executor configuration.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the generated definition artifacts.
    pub fn with_artifacts(mut self, artifacts: DefinitionArtifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

/// Point-in-time, versioned view of every agent record.
///
/// Snapshots are immutable once taken; the graph and plan layers only ever
/// read from one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Store version this snapshot was taken at
    pub version: u64,
    /// Records sorted by name
    pub agents: Vec<AgentRecord>,
}

impl AgentSnapshot {
    /// Creates a snapshot, sorting records by name.
    pub fn new(version: u64, mut agents: Vec<AgentRecord>) -> Self {
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Self { version, agents }
    }

    /// Looks up a record by name.
    pub fn get(&self, name: &AgentName) -> Option<&AgentRecord> {
        self.agents.iter().find(|r| &r.name == name)
    }

    /// Returns the names of every record.
    pub fn names(&self) -> Vec<AgentName> {
        self.agents.iter().map(|r| r.name.clone()).collect()
    }

    /// Returns a copy of this snapshot without the named agent.
    pub fn without(&self, name: &AgentName) -> Self {
        Self {
            version: self.version,
            agents: self
                .agents
                .iter()
                .filter(|r| &r.name != name)
                .cloned()
                .collect(),
        }
    }

    /// Returns a copy of this snapshot with `record` inserted or replacing
    /// the record of the same name.
    pub fn with_record(&self, record: AgentRecord) -> Self {
        let mut agents = self.without(&record.name).agents;
        agents.push(record);
        Self::new(self.version, agents)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
