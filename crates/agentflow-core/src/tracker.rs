//! Flow tracker: façade over the status store and the flow graph.
//!
//! Every mutation of the flow document is serialized by the
//! per-correlation lock. The held section is narrow: load the tree, edit
//! it in memory, store it back. Status and branch records go through the
//! store's conditional writes and need no lock.

use crate::catalog::AgentDefinition;
use crate::error::{BrokerError, Result};
use crate::flow::{AgentNode, BranchPlan, FlowDocument, PlannedTask};
use crate::store::StatusStore;
use crate::task::{
    AgentTaskRequest, BranchId, CorrelationId, GroupId, TaskInstanceId, TaskRecord,
};
use std::sync::Arc;

/// One branch to spawn: a group of child tasks sharing a fresh branch id.
#[derive(Debug, Clone)]
pub struct BranchSpawn {
    pub branch_id: BranchId,
    pub group_id: GroupId,
    pub tasks: Vec<AgentTaskRequest>,
}

impl BranchSpawn {
    fn plan(&self) -> Result<BranchPlan> {
        let tasks = self
            .tasks
            .iter()
            .map(|t| {
                t.task_instance_id
                    .map(|id| PlannedTask {
                        task_kind: t.task_kind.clone(),
                        task_instance_id: id,
                    })
                    .ok_or_else(|| {
                        BrokerError::Validation("spawned task has no instance id".into())
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BranchPlan {
            branch_id: self.branch_id,
            group_id: self.group_id.clone(),
            tasks,
        })
    }
}

/// Coordinates the status store and the persisted flow tree.
#[derive(Clone)]
pub struct FlowTracker {
    store: Arc<dyn StatusStore>,
}

impl FlowTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// First execution of a root: record it started and create the flow
    /// document with a single agent node.
    pub async fn root_agent_started(
        &self,
        agent: &AgentDefinition,
        task: &AgentTaskRequest,
    ) -> Result<TaskRecord> {
        let record = self.store.mark_started(task, agent).await?;
        let root = AgentNode::new(
            record.task_kind.clone(),
            record.task_instance_id,
            Some(agent.name.clone()),
        );
        self.store
            .insert_flow(FlowDocument::new(record.correlation_id, root))
            .await?;
        tracing::info!(
            "Root task '{}' started, correlation {}",
            record.task_kind,
            record.correlation_id
        );
        Ok(record)
    }

    /// A non-root pickup: record it started. Its node already exists in
    /// the flow because the parent created it when branching.
    pub async fn agent_started(
        &self,
        agent: &AgentDefinition,
        task: &AgentTaskRequest,
    ) -> Result<TaskRecord> {
        self.store.mark_started(task, agent).await
    }

    pub async fn agent_completed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.store.mark_completed(id, output).await
    }

    pub async fn agent_failed(
        &self,
        id: TaskInstanceId,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.store.mark_failed(id, output).await
    }

    /// Persist one response's spawns: child records as published, one
    /// active branch record per group, and the branch node attached into
    /// the flow tree under the lock.
    ///
    /// `resumed_after` carries the group a resuming parent just consumed;
    /// its spawns nest inside the branch that wrapped that group.
    pub async fn branch(
        &self,
        cid: CorrelationId,
        parent: TaskInstanceId,
        spawns: &[BranchSpawn],
        resumed_after: Option<GroupId>,
    ) -> Result<()> {
        let children: Vec<AgentTaskRequest> = spawns
            .iter()
            .flat_map(|s| s.tasks.iter().cloned())
            .collect();
        self.store.mark_published(&children).await?;

        let branch_ids: Vec<BranchId> = spawns.iter().map(|s| s.branch_id).collect();
        self.store.create_branches(parent, &branch_ids).await?;

        let inside_branch = match &resumed_after {
            Some(group) => Some(self.branch_of_group(cid, group).await?.ok_or_else(|| {
                BrokerError::Validation(format!("resumed group '{}' has no branch", group))
            })?),
            None => None,
        };
        let plans = spawns
            .iter()
            .map(|s| s.plan())
            .collect::<Result<Vec<_>>>()?;

        self.store.acquire_flow_lock(cid).await?;
        let result = async {
            let mut flow = self.store.load_flow(cid).await?;
            flow.branch(parent, &plans, inside_branch)?;
            self.store.store_flow(cid, flow.root).await
        }
        .await;
        self.store.release_flow_lock(cid).await?;
        result?;

        tracing::info!(
            "Attached {} branch(es) under task {} for correlation {}",
            spawns.len(),
            parent,
            cid
        );
        Ok(())
    }

    /// Whether every task of the group reached a terminal status. A
    /// failed child does not wedge its group; the parent observes the
    /// failure through the gathered outputs.
    pub async fn is_group_done(&self, cid: CorrelationId, group: &GroupId) -> Result<bool> {
        let records = self.store.find_group_tasks(cid, group).await?;
        Ok(records.iter().all(|r| r.status.is_terminal()))
    }

    /// The at-most-once election for resuming a parent after a group.
    pub async fn mark_group_resumed(
        &self,
        parent: TaskInstanceId,
        group: &GroupId,
    ) -> Result<bool> {
        self.store.mark_group_resumed(parent, group).await
    }

    /// The branch that wrapped a spawned group, recovered from the
    /// group's task records.
    pub async fn branch_of_group(
        &self,
        cid: CorrelationId,
        group: &GroupId,
    ) -> Result<Option<BranchId>> {
        let records = self.store.find_group_tasks(cid, group).await?;
        Ok(records.iter().find_map(|r| r.branch_id))
    }

    /// Record a resume: its task record is created as published (it takes
    /// the superseded parent's seat in the parent's own group) before the
    /// parent record is closed, so no drain check ever sees the lineage
    /// without a live representative.
    pub async fn resume_published(
        &self,
        resume: &AgentTaskRequest,
        superseded: TaskInstanceId,
    ) -> Result<()> {
        self.store
            .mark_published(std::slice::from_ref(resume))
            .await?;
        self.store.mark_completed(superseded, None).await
    }

    /// Close a branch and cascade upward: whenever every sibling of a
    /// freshly completed branch is itself completed, the enclosing branch
    /// completes too. Bounded by the depth of the flow tree.
    pub async fn mark_branch_completed(&self, cid: CorrelationId, branch: BranchId) -> Result<()> {
        let mut current = branch;
        loop {
            if !self.store.mark_branch_completed(current).await? {
                // someone else closed it; they drive the cascade
                return Ok(());
            }
            tracing::info!("Branch {} completed for correlation {}", current, cid);

            let flow = self.store.load_flow(cid).await?;
            let siblings = flow.sibling_branches(current);
            if siblings.is_empty() || !self.store.are_branches_completed(&siblings).await? {
                return Ok(());
            }
            match flow.parent_branch_id(current) {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }
    }

    pub async fn are_sibling_branches_completed(
        &self,
        cid: CorrelationId,
        branch: BranchId,
    ) -> Result<bool> {
        let flow = self.store.load_flow(cid).await?;
        let siblings = flow.sibling_branches(branch);
        self.store.are_branches_completed(&siblings).await
    }

    pub async fn find_group_tasks(
        &self,
        cid: CorrelationId,
        group: &GroupId,
    ) -> Result<Vec<TaskRecord>> {
        self.store.find_group_tasks(cid, group).await
    }

    pub async fn find_by_instance_id(&self, id: TaskInstanceId) -> Result<Option<TaskRecord>> {
        self.store.find_by_instance_id(id).await
    }
}
