//! The task execution engine.
//!
//! Every bus delivery (and every direct root submission) lands here. The
//! engine classifies the delivery, drives the agent call, and translates
//! the agent's stop reason into tracker operations and further bus
//! publications:
//!
//! - `subtasks` fans each returned group out as one branch and publishes
//!   the children;
//! - a terminal child outcome checks whether its group drained and, if
//!   so, lets exactly one delivery publish the parent's resume;
//! - a terminal resume closes the branch that wrapped the group it
//!   consumed, which cascades branch completion upward.

use crate::bus::{BusEnvelope, MessageBus};
use crate::catalog::AgentCatalog;
use crate::error::{BrokerError, Result};
use crate::invoker::{AgentInvoker, AgentTaskResponse, StopReason};
use crate::task::{
    AgentTaskRequest, BranchId, CorrelationId, GroupId, ParentTask, TaskCommand, TaskInstanceId,
};
use crate::tracker::{BranchSpawn, FlowTracker};
use serde_json::json;
use std::sync::Arc;

/// How a delivery enters the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// A brand-new root: no parent, start command.
    RootStart,
    /// A spawned subtask, or the resume of a parent that is itself a
    /// subtask (its parent reference is inherited from that parent).
    SubtaskStart,
    /// The resume of a root: no parent, resume command.
    RootResumption,
}

fn classify(task: &AgentTaskRequest) -> Delivery {
    if task.parent_task.is_some() {
        Delivery::SubtaskStart
    } else if matches!(task.command, TaskCommand::Resume { .. }) {
        Delivery::RootResumption
    } else {
        Delivery::RootStart
    }
}

/// The broker's per-delivery state machine.
pub struct TaskExecution {
    catalog: Arc<dyn AgentCatalog>,
    invoker: Arc<dyn AgentInvoker>,
    bus: Arc<dyn MessageBus>,
    tracker: FlowTracker,
    topic: String,
}

impl TaskExecution {
    pub fn new(
        catalog: Arc<dyn AgentCatalog>,
        invoker: Arc<dyn AgentInvoker>,
        bus: Arc<dyn MessageBus>,
        tracker: FlowTracker,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            invoker,
            bus,
            tracker,
            topic: topic.into(),
        }
    }

    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }

    /// Handle one delivered task end to end and return the agent's
    /// response. Root submissions get fresh correlation and instance ids;
    /// everything else must carry the ids its spawner assigned.
    pub async fn handle(&self, mut task: AgentTaskRequest) -> Result<AgentTaskResponse> {
        if task.task_kind.as_str().is_empty() {
            return Err(BrokerError::Validation("task kind is empty".into()));
        }
        let agent = self
            .catalog
            .find_by_task_kind(&task.task_kind)
            .await?
            .ok_or_else(|| BrokerError::AgentNotFound(task.task_kind.clone()))?;

        match classify(&task) {
            Delivery::RootStart => {
                task.correlation_id = Some(CorrelationId::new());
                task.task_instance_id = Some(TaskInstanceId::new());
                self.tracker.root_agent_started(&agent, &task).await?;
                let mut response = self.invoker.execute(&agent, &task).await?;
                self.dispatch(&task, &response).await?;
                // the submitter learns the fresh correlation from here
                if response.correlation_id.is_none() {
                    response.correlation_id = task.correlation_id;
                }
                Ok(response)
            }
            Delivery::SubtaskStart => {
                self.tracker.agent_started(&agent, &task).await?;
                let response = self.invoker.execute(&agent, &task).await?;
                self.dispatch(&task, &response).await?;
                if response.stop_reason != StopReason::Subtasks {
                    self.handle_child_completion(&task, &response).await?;
                }
                Ok(response)
            }
            Delivery::RootResumption => {
                self.tracker.agent_started(&agent, &task).await?;
                let response = self.invoker.execute(&agent, &task).await?;
                self.dispatch(&task, &response).await?;
                if response.stop_reason == StopReason::Completed {
                    self.handle_parent_span_completion(&task).await?;
                }
                Ok(response)
            }
        }
    }

    /// Translate the stop reason into status writes, and fan subtask
    /// groups out as branches.
    async fn dispatch(&self, task: &AgentTaskRequest, response: &AgentTaskResponse) -> Result<()> {
        let instance = require_instance(task)?;
        match response.stop_reason {
            StopReason::Completed => {
                self.tracker
                    .agent_completed(instance, response.task_output.clone())
                    .await
            }
            StopReason::Failed => {
                tracing::warn!("Task '{}' ({}) failed", task.task_kind, instance);
                self.tracker
                    .agent_failed(instance, response.task_output.clone())
                    .await
            }
            StopReason::Subtasks => self.spawn_subtasks(task, response).await,
        }
    }

    async fn spawn_subtasks(
        &self,
        task: &AgentTaskRequest,
        response: &AgentTaskResponse,
    ) -> Result<()> {
        let cid = require_correlation(task)?;
        let instance = require_instance(task)?;

        let groups = response.groups();
        if groups.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "agent for '{}' requested subtasks without any group",
                task.task_kind
            )));
        }

        let mut spawns = Vec::with_capacity(groups.len());
        for group in groups {
            if group.tasks.is_empty() {
                return Err(BrokerError::Protocol(format!(
                    "group '{}' has no tasks",
                    group.group_id
                )));
            }
            let branch_id = BranchId::new();
            let tasks = group
                .tasks
                .iter()
                .map(|subtask| AgentTaskRequest {
                    task_kind: subtask.task_kind.clone(),
                    task_instance_id: Some(TaskInstanceId::new()),
                    correlation_id: Some(cid),
                    command: TaskCommand::Start,
                    task_input_data: subtask.task_input_data.clone(),
                    parent_task: Some(ParentTask {
                        task_kind: task.task_kind.clone(),
                        task_instance_id: instance,
                    }),
                    group_id: Some(group.group_id.clone()),
                    branch_id: Some(branch_id),
                })
                .collect();
            spawns.push(BranchSpawn {
                branch_id,
                group_id: group.group_id.clone(),
                tasks,
            });
        }

        self.tracker
            .branch(cid, instance, &spawns, task.command.resumed_after().cloned())
            .await?;

        for spawn in &spawns {
            for child in &spawn.tasks {
                self.bus
                    .publish(&self.topic, BusEnvelope::task(cid, child.clone()))
                    .await?;
            }
        }
        tracing::info!(
            "Task '{}' spawned {} group(s) on correlation {}",
            task.task_kind,
            spawns.len(),
            cid
        );
        Ok(())
    }

    /// A subtask reached a terminal state. If it was a resume, close the
    /// branch around the group it consumed. Then check the group it
    /// belongs to: when the group has drained, exactly one concurrent
    /// delivery wins the gate and publishes the parent's resume.
    async fn handle_child_completion(
        &self,
        task: &AgentTaskRequest,
        response: &AgentTaskResponse,
    ) -> Result<()> {
        let cid = require_correlation(task)?;

        if response.stop_reason == StopReason::Completed {
            if let Some(resumed) = task.command.resumed_after() {
                self.close_resumed_branch(cid, resumed).await?;
            }
        }

        let Some(group) = task.group_id.clone() else {
            return Ok(());
        };
        let Some(parent) = task.parent_task.clone() else {
            return Ok(());
        };

        if !self.tracker.is_group_done(cid, &group).await? {
            return Ok(());
        }
        if !self
            .tracker
            .mark_group_resumed(parent.task_instance_id, &group)
            .await?
        {
            // a sibling's delivery won the election
            return Ok(());
        }
        self.publish_resume(cid, parent.task_instance_id, &group)
            .await
    }

    /// A root resumption completed. If the flow is fully done there is
    /// nothing to close; otherwise the branch wrapping the consumed group
    /// completes and the cascade runs.
    async fn handle_parent_span_completion(&self, task: &AgentTaskRequest) -> Result<()> {
        let cid = require_correlation(task)?;
        if let Some(resumed) = task.command.resumed_after() {
            self.close_resumed_branch(cid, resumed).await?;
        }
        Ok(())
    }

    async fn close_resumed_branch(&self, cid: CorrelationId, group: &GroupId) -> Result<()> {
        match self.tracker.branch_of_group(cid, group).await? {
            Some(branch) => self.tracker.mark_branch_completed(cid, branch).await,
            None => {
                tracing::warn!("No branch recorded for resumed group '{}'", group);
                Ok(())
            }
        }
    }

    /// As the elected caller: gather the group's outputs, rebuild the
    /// parent's input, and publish a fresh instance of the parent kind
    /// with the resume command. The resume inherits the parent's own
    /// parent, group, and branch, keeping it at the parent's level.
    async fn publish_resume(
        &self,
        cid: CorrelationId,
        parent_instance: TaskInstanceId,
        group: &GroupId,
    ) -> Result<()> {
        let records = self.tracker.find_group_tasks(cid, group).await?;
        let children_outputs: Vec<serde_json::Value> = records
            .iter()
            // records superseded by their own resume already reported
            // through that resume; they carry no output of their own
            .filter(|r| r.completed_groups.is_empty())
            .map(|r| r.output.clone().unwrap_or(serde_json::Value::Null))
            .collect();

        let parent = self
            .tracker
            .find_by_instance_id(parent_instance)
            .await?
            .ok_or(BrokerError::TaskNotFound(parent_instance))?;

        // a parent that is itself a resume keeps threading the original
        // input forward
        let original_input = parent
            .input
            .get("originalInput")
            .cloned()
            .unwrap_or_else(|| parent.input.clone());

        let resume = AgentTaskRequest {
            task_kind: parent.task_kind.clone(),
            task_instance_id: Some(TaskInstanceId::new()),
            correlation_id: Some(cid),
            command: TaskCommand::Resume {
                completed_task_group_id: group.clone(),
            },
            task_input_data: json!({
                "originalInput": original_input,
                "childrenOutputs": children_outputs,
            }),
            parent_task: match (&parent.parent_task_kind, parent.parent_task_instance_id) {
                (Some(kind), Some(id)) => Some(ParentTask {
                    task_kind: kind.clone(),
                    task_instance_id: id,
                }),
                _ => None,
            },
            group_id: parent.group_id.clone(),
            branch_id: parent.branch_id,
        };

        self.tracker.resume_published(&resume, parent_instance).await?;
        self.bus
            .publish(&self.topic, BusEnvelope::task(cid, resume))
            .await?;
        tracing::info!(
            "Published resume of '{}' after group '{}' on correlation {}",
            parent.task_kind,
            group,
            cid
        );
        Ok(())
    }
}

fn require_correlation(task: &AgentTaskRequest) -> Result<CorrelationId> {
    task.correlation_id
        .ok_or_else(|| BrokerError::Validation("task has no correlation id".into()))
}

fn require_instance(task: &AgentTaskRequest) -> Result<TaskInstanceId> {
    task.task_instance_id
        .ok_or_else(|| BrokerError::Validation("task has no instance id".into()))
}
