//! Task identifiers, commands, and persisted records.
//!
//! A task is one invocation of an agent. Every invocation gets a fresh
//! instance id, including the synthetic "resume" invocations the broker
//! publishes when a group of subtasks drains; the agent is stateless
//! between spans and receives everything it needs in the request body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable name for a type of work (e.g. `text.summarize`). One agent per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(pub String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskInstanceId(pub Uuid);

impl TaskInstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by every record of a single root invocation and all
/// of its descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one parallel path emitted by a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub Uuid);

impl BranchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a batch of sibling subtasks spawned together in one
/// agent response. Chosen by the agent, opaque to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a delivery asks the agent to do.
///
/// The resume command is what distinguishes a parent resumption from a
/// brand-new start; classification stays explicit rather than inferred
/// from record state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum TaskCommand {
    Start,
    #[serde(rename_all = "camelCase")]
    Resume { completed_task_group_id: GroupId },
}

impl Default for TaskCommand {
    fn default() -> Self {
        Self::Start
    }
}

impl TaskCommand {
    /// The group whose drain produced this resume, if any.
    pub fn resumed_after(&self) -> Option<&GroupId> {
        match self {
            Self::Start => None,
            Self::Resume {
                completed_task_group_id,
            } => Some(completed_task_group_id),
        }
    }
}

/// Reference to the task that spawned a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentTask {
    pub task_kind: TaskKind,
    pub task_instance_id: TaskInstanceId,
}

/// A task as delivered to the broker: the client submission shape, the bus
/// payload, and the body POSTed to agents are all this type.
///
/// Field names follow the agent wire protocol (camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskRequest {
    pub task_kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_instance_id: Option<TaskInstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub command: TaskCommand,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub task_input_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<ParentTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
}

impl AgentTaskRequest {
    /// A fresh root submission for the given kind.
    pub fn root(task_kind: TaskKind, task_input_data: serde_json::Value) -> Self {
        Self {
            task_kind,
            task_instance_id: None,
            correlation_id: None,
            command: TaskCommand::Start,
            task_input_data,
            parent_task: None,
            group_id: None,
            branch_id: None,
        }
    }
}

/// Lifecycle states of a task record. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Record created by the parent at spawn time; not yet picked up.
    Published,
    /// The broker picked the task off the bus and called the agent.
    Started,
    /// The agent returned a terminal success.
    Completed,
    /// The agent returned a terminal failure.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the store may apply `to` over the current status.
    /// Re-applying the current status is allowed (idempotent redelivery).
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Published, Started) => true,
            (Started, Completed) | (Started, Failed) => true,
            _ => false,
        }
    }
}

/// Persisted record of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub correlation_id: CorrelationId,
    pub task_kind: TaskKind,
    pub task_instance_id: TaskInstanceId,
    /// Name of the agent serving the task; unknown until started.
    pub agent_name: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub parent_task_kind: Option<TaskKind>,
    pub parent_task_instance_id: Option<TaskInstanceId>,
    pub group_id: Option<GroupId>,
    pub branch_id: Option<BranchId>,
    /// Groups of this task's children that have already triggered a resume.
    /// Written through a conditional add-to-set; the at-most-once gate.
    pub completed_groups: Vec<GroupId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
}

impl TaskRecord {
    /// Build a record from a delivery. The request must carry its ids;
    /// the engine assigns them before anything is persisted.
    pub fn from_request(task: &AgentTaskRequest, status: TaskStatus) -> crate::error::Result<Self> {
        let correlation_id = task.correlation_id.ok_or_else(|| {
            crate::error::BrokerError::Validation("task has no correlation id".into())
        })?;
        let task_instance_id = task.task_instance_id.ok_or_else(|| {
            crate::error::BrokerError::Validation("task has no instance id".into())
        })?;
        Ok(Self {
            correlation_id,
            task_kind: task.task_kind.clone(),
            task_instance_id,
            agent_name: None,
            status,
            started_at: Utc::now(),
            stopped_at: None,
            parent_task_kind: task.parent_task.as_ref().map(|p| p.task_kind.clone()),
            parent_task_instance_id: task.parent_task.as_ref().map(|p| p.task_instance_id),
            group_id: task.group_id.clone(),
            branch_id: task.branch_id,
            completed_groups: Vec::new(),
            input: task.task_input_data.clone(),
            output: None,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_task_instance_id.is_none()
    }
}

/// Status of a branch: one parallel sub-tree emitted by a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Completed,
}

/// Persisted record of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub branch_id: BranchId,
    pub parent_task_instance_id: TaskInstanceId,
    pub created_at: DateTime<Utc>,
    pub status: BranchStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BranchRecord {
    pub fn active(branch_id: BranchId, parent_task_instance_id: TaskInstanceId) -> Self {
        Self {
            branch_id,
            parent_task_instance_id,
            created_at: Utc::now(),
            status: BranchStatus::Active,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_defaults_to_start() {
        let task: AgentTaskRequest =
            serde_json::from_value(json!({"taskKind": "simple-task"})).unwrap();
        assert_eq!(task.command, TaskCommand::Start);
        assert!(task.task_instance_id.is_none());
    }

    #[test]
    fn resume_command_round_trips() {
        let command = TaskCommand::Resume {
            completed_task_group_id: GroupId::new("group-1"),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({"command": "resume", "completedTaskGroupId": "group-1"})
        );
        let back: TaskCommand = serde_json::from_value(value).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn request_uses_wire_field_names() {
        let task = AgentTaskRequest {
            task_kind: TaskKind::new("child"),
            task_instance_id: Some(TaskInstanceId::new()),
            correlation_id: Some(CorrelationId::new()),
            command: TaskCommand::Start,
            task_input_data: json!({"input": "x"}),
            parent_task: Some(ParentTask {
                task_kind: TaskKind::new("orch"),
                task_instance_id: TaskInstanceId::new(),
            }),
            group_id: Some(GroupId::new("group-1")),
            branch_id: Some(BranchId::new()),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert!(value.get("taskKind").is_some());
        assert!(value.get("taskInputData").is_some());
        assert!(value
            .get("parentTask")
            .unwrap()
            .get("taskInstanceId")
            .is_some());
        assert!(value.get("groupId").is_some());
        assert!(value.get("branchId").is_some());
    }

    #[test]
    fn status_moves_forward_only() {
        use TaskStatus::*;
        assert!(Published.can_transition_to(Started));
        assert!(Started.can_transition_to(Completed));
        assert!(Started.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Published.can_transition_to(Completed));
        // redelivery of the same outcome is a no-op, not an error
        assert!(Completed.can_transition_to(Completed));
        assert!(Started.can_transition_to(Started));
    }

    #[test]
    fn record_captures_parent_and_group_fields() {
        let parent = TaskInstanceId::new();
        let task = AgentTaskRequest {
            task_kind: TaskKind::new("child"),
            task_instance_id: Some(TaskInstanceId::new()),
            correlation_id: Some(CorrelationId::new()),
            command: TaskCommand::Start,
            task_input_data: json!({"input": "x"}),
            parent_task: Some(ParentTask {
                task_kind: TaskKind::new("orch"),
                task_instance_id: parent,
            }),
            group_id: Some(GroupId::new("group-1")),
            branch_id: Some(BranchId::new()),
        };
        let record = TaskRecord::from_request(&task, TaskStatus::Published).unwrap();
        assert_eq!(record.status, TaskStatus::Published);
        assert_eq!(record.parent_task_instance_id, Some(parent));
        assert_eq!(record.group_id, Some(GroupId::new("group-1")));
        assert!(!record.is_root());
    }

    #[test]
    fn record_requires_assigned_ids() {
        let task = AgentTaskRequest::root(TaskKind::new("simple-task"), json!({}));
        assert!(TaskRecord::from_request(&task, TaskStatus::Started).is_err());
    }
}
