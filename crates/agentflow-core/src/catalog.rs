//! Agent catalog: which agent serves which task kind.
//!
//! Agents are external HTTP workers. Each one serves exactly one task
//! kind; the broker looks the agent up per delivery and POSTs the task to
//! its execution endpoint. The catalog can be seeded from a YAML file at
//! startup and managed over the HTTP surface afterwards.

use crate::error::{BrokerError, Result};
use crate::task::TaskKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Where an agent can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub execution_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_path: Option<String>,
}

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    pub task_kind: TaskKind,
    pub endpoint: AgentEndpoint,
}

impl AgentDefinition {
    /// Full URL of the agent's execution endpoint.
    pub fn execution_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.endpoint.execution_path.trim_start_matches('/')
        )
    }
}

/// Lookup and management of agent registrations.
#[async_trait]
pub trait AgentCatalog: Send + Sync {
    /// Find the agent registered for a task kind.
    async fn find_by_task_kind(&self, kind: &TaskKind) -> Result<Option<AgentDefinition>>;

    /// Register a new agent. Fails if the kind is already taken.
    async fn insert(&self, agent: AgentDefinition) -> Result<()>;

    /// Register or replace the agent for a kind.
    async fn upsert(&self, agent: AgentDefinition) -> Result<()>;

    /// Remove the agent for a kind. Returns whether one was removed.
    async fn remove(&self, kind: &TaskKind) -> Result<bool>;

    /// All registrations, ordered by task kind.
    async fn list(&self) -> Result<Vec<AgentDefinition>>;
}

/// In-memory catalog backing the server.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    agents: RwLock<HashMap<TaskKind, AgentDefinition>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload every agent from a seed file, replacing existing entries.
    pub async fn seed(&self, file: CatalogFile) -> Result<()> {
        for agent in file.agents {
            self.upsert(agent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentCatalog for MemoryCatalog {
    async fn find_by_task_kind(&self, kind: &TaskKind) -> Result<Option<AgentDefinition>> {
        Ok(self.agents.read().await.get(kind).cloned())
    }

    async fn insert(&self, agent: AgentDefinition) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.task_kind) {
            return Err(BrokerError::AgentExists(agent.task_kind));
        }
        agents.insert(agent.task_kind.clone(), agent);
        Ok(())
    }

    async fn upsert(&self, agent: AgentDefinition) -> Result<()> {
        self.agents
            .write()
            .await
            .insert(agent.task_kind.clone(), agent);
        Ok(())
    }

    async fn remove(&self, kind: &TaskKind) -> Result<bool> {
        Ok(self.agents.write().await.remove(kind).is_some())
    }

    async fn list(&self) -> Result<Vec<AgentDefinition>> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.task_kind.as_str().cmp(b.task_kind.as_str()));
        Ok(agents)
    }
}

/// YAML seed file format for agent registrations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogFile {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl CatalogFile {
    /// Load registrations from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}
