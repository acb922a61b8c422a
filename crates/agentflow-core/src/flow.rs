//! In-memory flow graph: the persisted tree of one correlation.
//!
//! The tree is strictly forward-owned: every node owns its `next`
//! continuation and branch arms own their sub-trees. Upward queries
//! (`parent_branch_id`) are answered by traversal carrying the enclosing
//! branch arm, so the serialized form needs no back pointers and the
//! in-memory form keeps none either.

use crate::error::{BrokerError, Result};
use crate::task::{BranchId, CorrelationId, GroupId, TaskInstanceId, TaskKind};
use serde::{Deserialize, Serialize};

/// One agent invocation in the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub task_kind: TaskKind,
    pub task_instance_id: TaskInstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<FlowNode>>,
}

impl AgentNode {
    pub fn new(task_kind: TaskKind, task_instance_id: TaskInstanceId, name: Option<String>) -> Self {
        Self {
            task_kind,
            task_instance_id,
            name,
            next: None,
        }
    }
}

/// A batch of sibling agents spawned together as one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupNode {
    pub group_id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub agents: Vec<AgentNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<FlowNode>>,
}

/// One arm of a branch node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchArm {
    pub branch_id: BranchId,
    pub node: Box<FlowNode>,
}

/// A set of parallel paths emitted by one parent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchNode {
    pub branches: Vec<BranchArm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<FlowNode>>,
}

impl BranchNode {
    pub fn arm_ids(&self) -> Vec<BranchId> {
        self.branches.iter().map(|arm| arm.branch_id).collect()
    }
}

/// Node of the flow tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNode {
    Agent(AgentNode),
    Group(GroupNode),
    Branch(BranchNode),
}

/// Minimal shape of one spawned branch, as the tree needs it.
#[derive(Debug, Clone)]
pub struct BranchPlan {
    pub branch_id: BranchId,
    pub group_id: GroupId,
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task_kind: TaskKind,
    pub task_instance_id: TaskInstanceId,
}

impl FlowNode {
    fn next_slot(&mut self) -> &mut Option<Box<FlowNode>> {
        match self {
            FlowNode::Agent(a) => &mut a.next,
            FlowNode::Group(g) => &mut g.next,
            FlowNode::Branch(b) => &mut b.next,
        }
    }

    fn next(&self) -> Option<&FlowNode> {
        match self {
            FlowNode::Agent(a) => a.next.as_deref(),
            FlowNode::Group(g) => g.next.as_deref(),
            FlowNode::Branch(b) => b.next.as_deref(),
        }
    }
}

/// Walk a `next` chain to its open tail.
fn tail_slot(mut slot: &mut Option<Box<FlowNode>>) -> &mut Option<Box<FlowNode>> {
    while let Some(node) = slot {
        slot = node.next_slot();
    }
    slot
}

/// Build the branch node for a set of groups spawned in one response:
/// a single-task group becomes a bare agent arm, a larger group becomes
/// a group arm named after its group id.
fn branch_node_for(plans: &[BranchPlan]) -> BranchNode {
    let branches = plans
        .iter()
        .map(|plan| {
            let agents: Vec<AgentNode> = plan
                .tasks
                .iter()
                .map(|t| AgentNode::new(t.task_kind.clone(), t.task_instance_id, None))
                .collect();
            let node = if agents.len() == 1 {
                let mut single = agents;
                FlowNode::Agent(single.remove(0))
            } else {
                FlowNode::Group(GroupNode {
                    group_id: plan.group_id.clone(),
                    name: Some(plan.group_id.to_string()),
                    agents,
                    next: None,
                })
            };
            BranchArm {
                branch_id: plan.branch_id,
                node: Box::new(node),
            }
        })
        .collect();
    BranchNode {
        branches,
        next: None,
    }
}

/// The persisted flow of one correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
    pub correlation_id: CorrelationId,
    pub root: FlowNode,
    #[serde(default)]
    pub locked: bool,
}

impl FlowDocument {
    /// A fresh flow with a single root agent.
    pub fn new(correlation_id: CorrelationId, root: AgentNode) -> Self {
        Self {
            correlation_id,
            root: FlowNode::Agent(root),
            locked: false,
        }
    }

    /// Depth-first lookup of the agent node for an instance.
    pub fn find_agent_node(&self, id: TaskInstanceId) -> Option<&AgentNode> {
        find_agent_in(&self.root, id)
    }

    /// The branch node one of whose arms is the given branch.
    pub fn find_branch_node(&self, branch_id: BranchId) -> Option<&BranchNode> {
        find_branch_in(&self.root, branch_id)
    }

    pub fn contains_branch(&self, branch_id: BranchId) -> bool {
        self.find_branch_node(branch_id).is_some()
    }

    /// Peer branch ids inside the same branch node, the branch itself
    /// included. Empty when the branch is not in the tree.
    pub fn sibling_branches(&self, branch_id: BranchId) -> Vec<BranchId> {
        self.find_branch_node(branch_id)
            .map(|node| node.arm_ids())
            .unwrap_or_default()
    }

    /// The enclosing branch: the arm of an ancestor branch node whose
    /// sub-tree contains this branch. None for top-level branches.
    pub fn parent_branch_id(&self, branch_id: BranchId) -> Option<BranchId> {
        match find_enclosing(&self.root, branch_id, None) {
            Found::Parent(parent) => parent,
            Found::Missing => None,
        }
    }

    /// Attach the branches spawned by one response.
    ///
    /// Spawns from a resumed parent nest inside the branch that wrapped
    /// the resumed group; first spawns hang off the parent's agent node.
    pub fn branch(
        &mut self,
        parent: TaskInstanceId,
        plans: &[BranchPlan],
        inside_branch: Option<BranchId>,
    ) -> Result<()> {
        if plans.is_empty() {
            return Err(BrokerError::Validation("no branches to attach".into()));
        }
        let node = FlowNode::Branch(branch_node_for(plans));
        match inside_branch {
            Some(branch_id) => {
                let arm = find_arm_mut(&mut self.root, branch_id)
                    .ok_or(BrokerError::BranchNotFound(branch_id))?;
                let tail = tail_slot(arm.node.next_slot());
                *tail = Some(Box::new(node));
            }
            None => {
                let agent = find_agent_in_mut(&mut self.root, parent)
                    .ok_or(BrokerError::TaskNotFound(parent))?;
                let tail = tail_slot(&mut agent.next);
                *tail = Some(Box::new(node));
            }
        }
        Ok(())
    }
}

fn find_agent_in(node: &FlowNode, id: TaskInstanceId) -> Option<&AgentNode> {
    match node {
        FlowNode::Agent(agent) => {
            if agent.task_instance_id == id {
                return Some(agent);
            }
        }
        FlowNode::Group(group) => {
            for agent in &group.agents {
                if agent.task_instance_id == id {
                    return Some(agent);
                }
                if let Some(found) = agent.next.as_deref().and_then(|n| find_agent_in(n, id)) {
                    return Some(found);
                }
            }
        }
        FlowNode::Branch(branch) => {
            for arm in &branch.branches {
                if let Some(found) = find_agent_in(&arm.node, id) {
                    return Some(found);
                }
            }
        }
    }
    node.next().and_then(|n| find_agent_in(n, id))
}

fn find_agent_in_mut(node: &mut FlowNode, id: TaskInstanceId) -> Option<&mut AgentNode> {
    match node {
        FlowNode::Agent(agent) => {
            if agent.task_instance_id == id {
                return Some(agent);
            }
            agent.next.as_deref_mut().and_then(|n| find_agent_in_mut(n, id))
        }
        FlowNode::Group(group) => {
            for agent in &mut group.agents {
                if agent.task_instance_id == id {
                    return Some(agent);
                }
                if let Some(found) = agent
                    .next
                    .as_deref_mut()
                    .and_then(|n| find_agent_in_mut(n, id))
                {
                    return Some(found);
                }
            }
            group.next.as_deref_mut().and_then(|n| find_agent_in_mut(n, id))
        }
        FlowNode::Branch(branch) => {
            for arm in &mut branch.branches {
                if let Some(found) = find_agent_in_mut(&mut arm.node, id) {
                    return Some(found);
                }
            }
            branch
                .next
                .as_deref_mut()
                .and_then(|n| find_agent_in_mut(n, id))
        }
    }
}

fn find_branch_in(node: &FlowNode, branch_id: BranchId) -> Option<&BranchNode> {
    if let FlowNode::Branch(branch) = node {
        if branch.branches.iter().any(|arm| arm.branch_id == branch_id) {
            return Some(branch);
        }
    }
    match node {
        FlowNode::Agent(_) => {}
        FlowNode::Group(group) => {
            for agent in &group.agents {
                if let Some(found) = agent
                    .next
                    .as_deref()
                    .and_then(|n| find_branch_in(n, branch_id))
                {
                    return Some(found);
                }
            }
        }
        FlowNode::Branch(branch) => {
            for arm in &branch.branches {
                if let Some(found) = find_branch_in(&arm.node, branch_id) {
                    return Some(found);
                }
            }
        }
    }
    node.next().and_then(|n| find_branch_in(n, branch_id))
}

fn find_arm_mut(node: &mut FlowNode, branch_id: BranchId) -> Option<&mut BranchArm> {
    match node {
        FlowNode::Agent(agent) => agent
            .next
            .as_deref_mut()
            .and_then(|n| find_arm_mut(n, branch_id)),
        FlowNode::Group(group) => {
            for agent in &mut group.agents {
                if let Some(found) = agent
                    .next
                    .as_deref_mut()
                    .and_then(|n| find_arm_mut(n, branch_id))
                {
                    return Some(found);
                }
            }
            group.next.as_deref_mut().and_then(|n| find_arm_mut(n, branch_id))
        }
        FlowNode::Branch(branch) => {
            if let Some(index) = branch
                .branches
                .iter()
                .position(|arm| arm.branch_id == branch_id)
            {
                return Some(&mut branch.branches[index]);
            }
            for arm in &mut branch.branches {
                if let Some(found) = find_arm_mut(&mut arm.node, branch_id) {
                    return Some(found);
                }
            }
            branch
                .next
                .as_deref_mut()
                .and_then(|n| find_arm_mut(n, branch_id))
        }
    }
}

/// Outcome of the enclosing-branch search.
enum Found {
    /// The branch node was located; its enclosing arm, if any.
    Parent(Option<BranchId>),
    Missing,
}

fn find_enclosing(node: &FlowNode, target: BranchId, enclosing: Option<BranchId>) -> Found {
    match node {
        FlowNode::Agent(_) => {}
        FlowNode::Group(group) => {
            for agent in &group.agents {
                if let Some(next) = agent.next.as_deref() {
                    if let Found::Parent(p) = find_enclosing(next, target, enclosing) {
                        return Found::Parent(p);
                    }
                }
            }
        }
        FlowNode::Branch(branch) => {
            if branch.branches.iter().any(|arm| arm.branch_id == target) {
                return Found::Parent(enclosing);
            }
            for arm in &branch.branches {
                if let Found::Parent(p) = find_enclosing(&arm.node, target, Some(arm.branch_id)) {
                    return Found::Parent(p);
                }
            }
        }
    }
    match node.next() {
        Some(next) => find_enclosing(next, target, enclosing),
        None => Found::Missing,
    }
}
