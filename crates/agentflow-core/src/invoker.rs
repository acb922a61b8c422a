//! Invoking agents over HTTP and parsing their typed responses.
//!
//! An agent receives the task as a JSON POST and answers with a stop
//! reason: it completed, it failed, or it wants subtask groups spawned.
//! Remote failure (non-2xx) is folded into a `failed` response so the
//! engine records it like any other outcome; an unparsable body is a
//! protocol error and aborts the delivery instead.

use crate::catalog::AgentDefinition;
use crate::error::{BrokerError, Result};
use crate::task::{AgentTaskRequest, CorrelationId, GroupId, TaskKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Discriminant of an agent's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Failed,
    Subtasks,
}

/// One subtask inside a spawned group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskRequest {
    /// Kind of child work to spawn. Older agents send this as `taskId`.
    #[serde(alias = "taskId")]
    pub task_kind: TaskKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub task_input_data: serde_json::Value,
}

/// A batch of sibling subtasks spawned together by one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskGroup {
    pub group_id: GroupId,
    pub tasks: Vec<SubtaskRequest>,
}

/// Typed response envelope returned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<SubtaskGroup>>,
}

impl AgentTaskResponse {
    /// Synthesized failure, used when the agent endpoint itself errors.
    pub fn remote_failure(status: u16, body: String) -> Self {
        Self {
            task_id: None,
            correlation_id: None,
            stop_reason: StopReason::Failed,
            task_output: Some(json!({"error": {"status": status, "body": body}})),
            subtasks: None,
        }
    }

    pub fn groups(&self) -> &[SubtaskGroup] {
        self.subtasks.as_deref().unwrap_or(&[])
    }
}

/// Drives one agent invocation.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentDefinition,
        task: &AgentTaskRequest,
    ) -> Result<AgentTaskResponse>;
}

/// Production invoker: HTTP POST to the agent's execution endpoint.
#[derive(Debug, Clone)]
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpAgentInvoker {
    pub fn new(bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bearer_token,
        }
    }

    pub fn with_timeout(bearer_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            bearer_token,
        }
    }
}

impl Default for HttpAgentInvoker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn execute(
        &self,
        agent: &AgentDefinition,
        task: &AgentTaskRequest,
    ) -> Result<AgentTaskResponse> {
        let correlation_id = task
            .correlation_id
            .ok_or_else(|| BrokerError::Validation("task has no correlation id".into()))?;

        let mut request = self
            .client
            .post(agent.execution_url())
            .header("x-correlation-id", correlation_id.to_string())
            .json(task);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::warn!(
                "Agent '{}' answered {} for task kind '{}'",
                agent.name,
                status,
                task.task_kind
            );
            return Ok(AgentTaskResponse::remote_failure(status.as_u16(), body));
        }

        serde_json::from_str(&body).map_err(|e| {
            BrokerError::Protocol(format!(
                "unparsable response from agent '{}': {}",
                agent.name, e
            ))
        })
    }
}
