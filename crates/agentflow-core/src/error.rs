//! Broker-wide error type.

use crate::task::{BranchId, CorrelationId, TaskInstanceId, TaskKind, TaskStatus};
use thiserror::Error;

/// Errors surfaced by the broker core.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid task delivery: {0}")]
    Validation(String),

    #[error("no agent registered for task kind '{0}'")]
    AgentNotFound(TaskKind),

    #[error("an agent is already registered for task kind '{0}'")]
    AgentExists(TaskKind),

    #[error("task record not found: {0}")]
    TaskNotFound(TaskInstanceId),

    #[error("branch record not found: {0}")]
    BranchNotFound(BranchId),

    #[error("no flow recorded for correlation {0}")]
    FlowNotFound(CorrelationId),

    #[error("task {task} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task: TaskInstanceId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("agent protocol violation: {0}")]
    Protocol(String),

    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bus publish failed: {0}")]
    Bus(String),

    #[error("flow lock contention for correlation {0}")]
    LockContention(CorrelationId),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
