//! Persistence port for task, branch, and flow state.
//!
//! The production backend is a document store with conditional updates;
//! those conditional writes are the broker's synchronization primitives.
//! `MemoryStatusStore` implements the same contracts in process so a
//! single binary is a working dev broker and the engine is testable
//! without infrastructure:
//!
//! - task status upserts only move forward (published → started →
//!   completed | failed), and re-applying a state is a no-op so bus
//!   redeliveries are harmless;
//! - a branch moves active → completed exactly once, and the caller that
//!   performed the transition is told so;
//! - `mark_group_resumed` is an add-to-set on the parent record that
//!   admits exactly one concurrent caller per group;
//! - the flow document carries a `locked` flag driven as a bounded
//!   spin-lock.

use crate::catalog::AgentDefinition;
use crate::error::{BrokerError, Result};
use crate::flow::{FlowDocument, FlowNode};
use crate::task::{
    AgentTaskRequest, BranchId, BranchRecord, BranchStatus, CorrelationId, GroupId, TaskInstanceId,
    TaskRecord, TaskStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// How many times the flow lock is attempted before giving up.
const LOCK_ATTEMPTS: u32 = 10;
/// Pause between attempts.
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// Store operations the broker relies on. All of them are idempotent when
/// their inputs are unchanged.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Upsert the record for a picked-up task as started, stamping the
    /// serving agent. Legal from absent, published, or an identical
    /// started record; refused from a terminal status.
    async fn mark_started(
        &self,
        task: &AgentTaskRequest,
        agent: &AgentDefinition,
    ) -> Result<TaskRecord>;

    /// Terminal success: status, stop time, and output set together.
    async fn mark_completed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Terminal failure: status, stop time, and output set together.
    async fn mark_failed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Insert records for freshly spawned tasks as published.
    async fn mark_published(&self, tasks: &[AgentTaskRequest]) -> Result<()>;

    /// Insert one active branch record per branch.
    async fn create_branches(&self, parent: TaskInstanceId, branches: &[BranchId]) -> Result<()>;

    /// Transition a branch active → completed. Returns whether this
    /// caller performed the transition.
    async fn mark_branch_completed(&self, branch: BranchId) -> Result<bool>;

    /// True iff every listed branch exists and is completed. Vacuously
    /// true for an empty list.
    async fn are_branches_completed(&self, branches: &[BranchId]) -> Result<bool>;

    /// The at-most-once gate for parent resumption: add the group to the
    /// parent record's completed set. Exactly one concurrent caller per
    /// group sees `true`.
    async fn mark_group_resumed(&self, parent: TaskInstanceId, group: &GroupId) -> Result<bool>;

    /// Records of one group, ordered by start time then instance id.
    async fn find_group_tasks(
        &self,
        cid: CorrelationId,
        group: &GroupId,
    ) -> Result<Vec<TaskRecord>>;

    async fn find_by_instance_id(&self, id: TaskInstanceId) -> Result<Option<TaskRecord>>;

    async fn find_by_correlation(&self, cid: CorrelationId) -> Result<Vec<TaskRecord>>;

    /// Root records (no parent), newest first.
    async fn find_all_roots(&self) -> Result<Vec<TaskRecord>>;

    /// Create the flow document for a fresh correlation.
    async fn insert_flow(&self, flow: FlowDocument) -> Result<()>;

    async fn load_flow(&self, cid: CorrelationId) -> Result<FlowDocument>;

    /// Replace the stored tree. The lock flag is untouched.
    async fn store_flow(&self, cid: CorrelationId, root: FlowNode) -> Result<()>;

    /// Take the per-correlation flow lock: a conditional `locked != true`
    /// write with bounded retry and back-off.
    async fn acquire_flow_lock(&self, cid: CorrelationId) -> Result<()>;

    async fn release_flow_lock(&self, cid: CorrelationId) -> Result<()>;
}

/// In-process store with the same conditional semantics as the document
/// store backing a deployment.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    tasks: Mutex<HashMap<TaskInstanceId, TaskRecord>>,
    branches: Mutex<HashMap<BranchId, BranchRecord>>,
    flows: Mutex<HashMap<CorrelationId, FlowDocument>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn apply_terminal(
        &self,
        id: TaskInstanceId,
        to: TaskStatus,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(&id).ok_or(BrokerError::TaskNotFound(id))?;
        if record.status == to {
            return Ok(());
        }
        if !record.status.can_transition_to(to) {
            return Err(BrokerError::InvalidTransition {
                task: id,
                from: record.status,
                to,
            });
        }
        record.status = to;
        record.stopped_at = Some(Utc::now());
        record.output = output;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn mark_started(
        &self,
        task: &AgentTaskRequest,
        agent: &AgentDefinition,
    ) -> Result<TaskRecord> {
        let mut record = TaskRecord::from_request(task, TaskStatus::Started)?;
        record.agent_name = Some(agent.name.clone());

        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&record.task_instance_id) {
            None => {
                tasks.insert(record.task_instance_id, record.clone());
                Ok(record)
            }
            Some(existing) => {
                if !existing.status.can_transition_to(TaskStatus::Started) {
                    return Err(BrokerError::InvalidTransition {
                        task: record.task_instance_id,
                        from: existing.status,
                        to: TaskStatus::Started,
                    });
                }
                existing.status = TaskStatus::Started;
                existing.agent_name = Some(agent.name.clone());
                existing.started_at = record.started_at;
                existing.input = record.input.clone();
                existing.parent_task_kind = record.parent_task_kind.clone();
                existing.parent_task_instance_id = record.parent_task_instance_id;
                existing.group_id = record.group_id.clone();
                existing.branch_id = record.branch_id;
                Ok(existing.clone())
            }
        }
    }

    async fn mark_completed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.apply_terminal(id, TaskStatus::Completed, output).await
    }

    async fn mark_failed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.apply_terminal(id, TaskStatus::Failed, output).await
    }

    async fn mark_published(&self, requests: &[AgentTaskRequest]) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        for request in requests {
            let record = TaskRecord::from_request(request, TaskStatus::Published)?;
            // redelivered spawns keep whatever progress the record made
            tasks.entry(record.task_instance_id).or_insert(record);
        }
        Ok(())
    }

    async fn create_branches(&self, parent: TaskInstanceId, ids: &[BranchId]) -> Result<()> {
        let mut branches = self.branches.lock().await;
        for id in ids {
            branches
                .entry(*id)
                .or_insert_with(|| BranchRecord::active(*id, parent));
        }
        Ok(())
    }

    async fn mark_branch_completed(&self, branch: BranchId) -> Result<bool> {
        let mut branches = self.branches.lock().await;
        let record = branches
            .get_mut(&branch)
            .ok_or(BrokerError::BranchNotFound(branch))?;
        match record.status {
            BranchStatus::Completed => Ok(false),
            BranchStatus::Active => {
                record.status = BranchStatus::Completed;
                record.completed_at = Some(Utc::now());
                Ok(true)
            }
        }
    }

    async fn are_branches_completed(&self, ids: &[BranchId]) -> Result<bool> {
        let branches = self.branches.lock().await;
        Ok(ids.iter().all(|id| {
            branches
                .get(id)
                .map(|b| b.status == BranchStatus::Completed)
                .unwrap_or(false)
        }))
    }

    async fn mark_group_resumed(&self, parent: TaskInstanceId, group: &GroupId) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks
            .get_mut(&parent)
            .ok_or(BrokerError::TaskNotFound(parent))?;
        if record.completed_groups.contains(group) {
            return Ok(false);
        }
        record.completed_groups.push(group.clone());
        Ok(true)
    }

    async fn find_group_tasks(
        &self,
        cid: CorrelationId,
        group: &GroupId,
    ) -> Result<Vec<TaskRecord>> {
        let tasks = self.tasks.lock().await;
        let mut records: Vec<TaskRecord> = tasks
            .values()
            .filter(|r| r.correlation_id == cid && r.group_id.as_ref() == Some(group))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_instance_id.0.cmp(&b.task_instance_id.0))
        });
        Ok(records)
    }

    async fn find_by_instance_id(&self, id: TaskInstanceId) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn find_by_correlation(&self, cid: CorrelationId) -> Result<Vec<TaskRecord>> {
        let tasks = self.tasks.lock().await;
        let mut records: Vec<TaskRecord> = tasks
            .values()
            .filter(|r| r.correlation_id == cid)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }

    async fn find_all_roots(&self) -> Result<Vec<TaskRecord>> {
        let tasks = self.tasks.lock().await;
        let mut records: Vec<TaskRecord> = tasks.values().filter(|r| r.is_root()).cloned().collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    async fn insert_flow(&self, flow: FlowDocument) -> Result<()> {
        self.flows.lock().await.insert(flow.correlation_id, flow);
        Ok(())
    }

    async fn load_flow(&self, cid: CorrelationId) -> Result<FlowDocument> {
        self.flows
            .lock()
            .await
            .get(&cid)
            .cloned()
            .ok_or(BrokerError::FlowNotFound(cid))
    }

    async fn store_flow(&self, cid: CorrelationId, root: FlowNode) -> Result<()> {
        let mut flows = self.flows.lock().await;
        let flow = flows.get_mut(&cid).ok_or(BrokerError::FlowNotFound(cid))?;
        flow.root = root;
        Ok(())
    }

    async fn acquire_flow_lock(&self, cid: CorrelationId) -> Result<()> {
        for attempt in 0..LOCK_ATTEMPTS {
            {
                let mut flows = self.flows.lock().await;
                let flow = flows.get_mut(&cid).ok_or(BrokerError::FlowNotFound(cid))?;
                if !flow.locked {
                    flow.locked = true;
                    return Ok(());
                }
            }
            tracing::debug!(
                "Flow {} is locked, retrying (attempt {}/{})",
                cid,
                attempt + 1,
                LOCK_ATTEMPTS
            );
            tokio::time::sleep(LOCK_BACKOFF).await;
        }
        Err(BrokerError::LockContention(cid))
    }

    async fn release_flow_lock(&self, cid: CorrelationId) -> Result<()> {
        if let Some(flow) = self.flows.lock().await.get_mut(&cid) {
            flow.locked = false;
        }
        Ok(())
    }
}
