pub mod bus;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod flow;
pub mod invoker;
pub mod store;
pub mod task;
pub mod tracker;

pub use bus::{BusEnvelope, LocalQueue, MessageBus};
pub use catalog::{AgentCatalog, AgentDefinition, MemoryCatalog};
pub use engine::TaskExecution;
pub use error::{BrokerError, Result};
pub use invoker::{AgentInvoker, AgentTaskResponse, HttpAgentInvoker, StopReason};
pub use store::{MemoryStatusStore, StatusStore};
pub use task::{AgentTaskRequest, CorrelationId, TaskInstanceId, TaskKind, TaskStatus};
pub use tracker::FlowTracker;
