//! Collaborator interfaces consumed by lifecycle operations.
//!
//! - [`DefinitionGenerator`]: produces and removes an agent's durable
//!   executable definition
//! - [`InstructionPropagator`]: regenerates other agents' instructions when
//!   the roster changes
//!
//! In-memory implementations are provided for embedding and tests.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use conclave_core::{AgentName, AgentRecord, AgentSnapshot, DefinitionArtifacts};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// A file submitted as part of an agent definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionFile {
    pub file_name: String,
    pub contents: String,
}

impl DefinitionFile {
    pub fn new(file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            contents: contents.into(),
        }
    }
}

/// Saved copy of an agent's generated definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSnapshot {
    pub agent: AgentName,
    pub artifacts: DefinitionArtifacts,
    pub definition: serde_json::Value,
}

/// Produces durable executable definitions for agents.
#[async_trait]
pub trait DefinitionGenerator: Send + Sync {
    /// Validates submitted files, staging them for materialization.
    async fn validate_files(&self, agent: &AgentName, files: &[DefinitionFile])
        -> anyhow::Result<()>;

    /// Drops anything staged by `validate_files`.
    async fn discard_validation(&self, agent: &AgentName) -> anyhow::Result<()>;

    /// Produces the first definition for a new agent.
    async fn materialize(&self, record: &AgentRecord) -> anyhow::Result<DefinitionArtifacts>;

    /// Produces a new revision of an existing agent's definition.
    async fn regenerate(&self, record: &AgentRecord) -> anyhow::Result<DefinitionArtifacts>;

    /// Captures the current definition, if one exists.
    async fn snapshot(&self, agent: &AgentName) -> anyhow::Result<Option<ArtifactSnapshot>>;

    /// Puts a captured definition back in place.
    async fn restore(&self, snapshot: &ArtifactSnapshot) -> anyhow::Result<()>;

    /// Removes the agent's definition. Removing a missing definition succeeds.
    async fn delete(&self, agent: &AgentName) -> anyhow::Result<()>;
}

/// Regenerates agent instructions when the roster changes.
///
/// Each method returns how many instruction sets were regenerated.
#[async_trait]
pub trait InstructionPropagator: Send + Sync {
    async fn on_addition(&self, agent: &AgentName, roster: &AgentSnapshot)
        -> anyhow::Result<usize>;

    async fn on_removal(&self, agents: &[AgentName], roster: &AgentSnapshot)
        -> anyhow::Result<usize>;

    async fn on_modification(&self, agent: &AgentName, roster: &AgentSnapshot)
        -> anyhow::Result<usize>;
}

#[derive(Debug, Default)]
struct GeneratorState {
    staged: HashMap<AgentName, Vec<DefinitionFile>>,
    definitions: HashMap<AgentName, ArtifactSnapshot>,
}

/// Definition generator keeping definitions in memory.
///
/// Definitions are JSON documents describing the agent's role, declared
/// dependencies, configuration and bundled files.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDefinitionGenerator {
    state: Arc<RwLock<GeneratorState>>,
}

impl InMemoryDefinitionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current definition document for an agent.
    pub fn definition(&self, agent: &AgentName) -> Option<serde_json::Value> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.definitions.get(agent).map(|s| s.definition.clone())
    }

    /// Returns true if files are staged for the agent.
    pub fn has_staged_files(&self, agent: &AgentName) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.staged.contains_key(agent)
    }

    fn write(&self) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, GeneratorState>> {
        self.state
            .write()
            .map_err(|e| anyhow!("generator state lock failed: {}", e))
    }

    fn render(record: &AgentRecord, revision: u32, files: Vec<String>) -> ArtifactSnapshot {
        let definition = serde_json::json!({
            "name": record.name,
            "display_name": record.display_name,
            "role": record.role,
            "dependencies": record.dependencies,
            "config": record.config,
            "files": files,
            "revision": revision,
        });
        ArtifactSnapshot {
            agent: record.name.clone(),
            artifacts: DefinitionArtifacts {
                location: format!("memory://agents/{}/definition.json", record.name),
                revision,
                files,
            },
            definition,
        }
    }
}

#[async_trait]
impl DefinitionGenerator for InMemoryDefinitionGenerator {
    async fn validate_files(
        &self,
        agent: &AgentName,
        files: &[DefinitionFile],
    ) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for file in files {
            if file.file_name.trim().is_empty() {
                bail!("definition file for {} has an empty name", agent);
            }
            if file.contents.trim().is_empty() {
                bail!("definition file {} is empty", file.file_name);
            }
            if !seen.insert(file.file_name.as_str()) {
                bail!("definition file {} submitted twice", file.file_name);
            }
        }
        self.write()?.staged.insert(agent.clone(), files.to_vec());
        Ok(())
    }

    async fn discard_validation(&self, agent: &AgentName) -> anyhow::Result<()> {
        self.write()?.staged.remove(agent);
        Ok(())
    }

    async fn materialize(&self, record: &AgentRecord) -> anyhow::Result<DefinitionArtifacts> {
        let mut state = self.write()?;
        if state.definitions.contains_key(&record.name) {
            bail!("definition for {} already exists", record.name);
        }
        let files = state
            .staged
            .remove(&record.name)
            .unwrap_or_default()
            .into_iter()
            .map(|f| f.file_name)
            .collect();
        let snapshot = Self::render(record, 1, files);
        let artifacts = snapshot.artifacts.clone();
        state.definitions.insert(record.name.clone(), snapshot);
        Ok(artifacts)
    }

    async fn regenerate(&self, record: &AgentRecord) -> anyhow::Result<DefinitionArtifacts> {
        let mut state = self.write()?;
        let (revision, files) = match state.definitions.get(&record.name) {
            Some(existing) => (
                existing.artifacts.revision + 1,
                existing.artifacts.files.clone(),
            ),
            None => (1, Vec::new()),
        };
        let snapshot = Self::render(record, revision, files);
        let artifacts = snapshot.artifacts.clone();
        state.definitions.insert(record.name.clone(), snapshot);
        Ok(artifacts)
    }

    async fn snapshot(&self, agent: &AgentName) -> anyhow::Result<Option<ArtifactSnapshot>> {
        let state = self
            .state
            .read()
            .map_err(|e| anyhow!("generator state lock failed: {}", e))?;
        Ok(state.definitions.get(agent).cloned())
    }

    async fn restore(&self, snapshot: &ArtifactSnapshot) -> anyhow::Result<()> {
        self.write()?
            .definitions
            .insert(snapshot.agent.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, agent: &AgentName) -> anyhow::Result<()> {
        let mut state = self.write()?;
        state.definitions.remove(agent);
        state.staged.remove(agent);
        Ok(())
    }
}

/// Propagator that rewrites a roster-aware instruction for every agent.
///
/// Each agent's instruction names its role, its dependencies and the rest of
/// the team. The coordinator's instruction lists every worker.
#[derive(Clone, Debug, Default)]
pub struct RosterPropagator {
    instructions: Arc<RwLock<BTreeMap<AgentName, String>>>,
}

impl RosterPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current instruction text for an agent.
    pub fn instructions_for(&self, agent: &AgentName) -> Option<String> {
        let map = self.instructions.read().unwrap_or_else(|e| e.into_inner());
        map.get(agent).cloned()
    }

    fn render(record: &AgentRecord, roster: &AgentSnapshot) -> String {
        let teammates: Vec<&str> = roster
            .agents
            .iter()
            .filter(|r| r.name != record.name)
            .map(|r| r.name.as_str())
            .collect();

        if record.name.is_coordinator() {
            return format!(
                "You coordinate the team. Workers: {}.",
                if teammates.is_empty() { "none".to_string() } else { teammates.join(", ") }
            );
        }

        let deps: Vec<&str> = record.dependencies.iter().map(AgentName::as_str).collect();
        format!(
            "You are {} ({}). Build on the outputs of: {}. Teammates: {}.",
            record.display_name,
            if record.role.is_empty() { "agent" } else { record.role.as_str() },
            if deps.is_empty() { "none".to_string() } else { deps.join(", ") },
            if teammates.is_empty() { "none".to_string() } else { teammates.join(", ") },
        )
    }

    /// Rewrites instructions for every rostered agent except `skip`.
    fn regenerate(&self, roster: &AgentSnapshot, skip: &[AgentName]) -> anyhow::Result<usize> {
        let mut map = self
            .instructions
            .write()
            .map_err(|e| anyhow!("instruction lock failed: {}", e))?;
        let mut regenerated = 0;
        for record in &roster.agents {
            if skip.contains(&record.name) {
                continue;
            }
            map.insert(record.name.clone(), Self::render(record, roster));
            regenerated += 1;
        }
        Ok(regenerated)
    }
}

#[async_trait]
impl InstructionPropagator for RosterPropagator {
    async fn on_addition(&self, agent: &AgentName, roster: &AgentSnapshot) -> anyhow::Result<usize> {
        let regenerated = self.regenerate(roster, &[])?;
        tracing::debug!(agent = %agent, regenerated, "instructions propagated for addition");
        Ok(regenerated)
    }

    async fn on_removal(
        &self,
        agents: &[AgentName],
        roster: &AgentSnapshot,
    ) -> anyhow::Result<usize> {
        {
            let mut map = self
                .instructions
                .write()
                .map_err(|e| anyhow!("instruction lock failed: {}", e))?;
            for agent in agents {
                map.remove(agent);
            }
        }
        self.regenerate(roster, agents)
    }

    async fn on_modification(
        &self,
        agent: &AgentName,
        roster: &AgentSnapshot,
    ) -> anyhow::Result<usize> {
        let regenerated = self.regenerate(roster, &[])?;
        tracing::debug!(agent = %agent, regenerated, "instructions propagated for modification");
        Ok(regenerated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> AgentName {
        AgentName::new(s)
    }

    #[tokio::test]
    async fn test_validate_rejects_duplicate_files() {
        let generator = InMemoryDefinitionGenerator::new();
        let files = vec![
            DefinitionFile::new("tools.py", "def run(): pass"),
            DefinitionFile::new("tools.py", "def run(): pass"),
        ];
        let err = generator.validate_files(&name("a"), &files).await.unwrap_err();
        assert!(err.to_string().contains("submitted twice"));
        assert!(!generator.has_staged_files(&name("a")));
    }

    #[tokio::test]
    async fn test_materialize_consumes_staged_files() {
        let generator = InMemoryDefinitionGenerator::new();
        generator
            .validate_files(&name("a"), &[DefinitionFile::new("tools.py", "x = 1")])
            .await
            .unwrap();

        let artifacts = generator.materialize(&AgentRecord::new("a")).await.unwrap();
        assert_eq!(artifacts.revision, 1);
        assert_eq!(artifacts.files, vec!["tools.py".to_string()]);
        assert!(!generator.has_staged_files(&name("a")));
        assert_eq!(generator.definition(&name("a")).unwrap()["name"], "a");
    }

    #[tokio::test]
    async fn test_regenerate_and_restore() {
        let generator = InMemoryDefinitionGenerator::new();
        generator.materialize(&AgentRecord::new("a")).await.unwrap();
        let before = generator.snapshot(&name("a")).await.unwrap().unwrap();

        let artifacts = generator
            .regenerate(&AgentRecord::new("a").with_role("critic"))
            .await
            .unwrap();
        assert_eq!(artifacts.revision, 2);

        generator.restore(&before).await.unwrap();
        let restored = generator.snapshot(&name("a")).await.unwrap().unwrap();
        assert_eq!(restored.artifacts.revision, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let generator = InMemoryDefinitionGenerator::new();
        generator.delete(&name("ghost")).await.unwrap();
        assert!(generator.snapshot(&name("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roster_propagation() {
        let propagator = RosterPropagator::new();
        let roster = AgentSnapshot::new(
            1,
            vec![
                AgentRecord::new("coordinator"),
                AgentRecord::new("market").with_role("research"),
                AgentRecord::new("analyst").with_dependencies(["market"]),
            ],
        );

        let count = propagator.on_addition(&name("analyst"), &roster).await.unwrap();
        assert_eq!(count, 3);

        let analyst = propagator.instructions_for(&name("analyst")).unwrap();
        assert!(analyst.contains("Build on the outputs of: market"));
        let coordinator = propagator.instructions_for(&name("coordinator")).unwrap();
        assert!(coordinator.contains("analyst"));

        let remaining = roster.without(&name("analyst"));
        propagator.on_removal(&[name("analyst")], &remaining).await.unwrap();
        assert!(propagator.instructions_for(&name("analyst")).is_none());
        let coordinator = propagator.instructions_for(&name("coordinator")).unwrap();
        assert!(!coordinator.contains("analyst"));
    }
}
