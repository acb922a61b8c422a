//! Server state: the wired-up broker components.

use agentflow_core::bus::{BusEnvelope, LocalQueue};
use agentflow_core::catalog::{AgentCatalog, MemoryCatalog};
use agentflow_core::engine::TaskExecution;
use agentflow_core::invoker::HttpAgentInvoker;
use agentflow_core::store::{MemoryStatusStore, StatusStore};
use agentflow_core::tracker::FlowTracker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Topic the broker publishes task deliveries on.
pub const TASK_TOPIC: &str = "tasks";

/// Everything the HTTP surface needs, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn AgentCatalog>,
    pub store: Arc<dyn StatusStore>,
    pub engine: Arc<TaskExecution>,
}

impl AppState {
    /// Build the broker on the in-process store and local queue. Returns
    /// the queue's receiving end for the delivery loop.
    pub fn new(agent_token: Option<String>) -> (Self, mpsc::UnboundedReceiver<BusEnvelope>) {
        let catalog: Arc<MemoryCatalog> = Arc::new(MemoryCatalog::new());
        let store: Arc<MemoryStatusStore> = Arc::new(MemoryStatusStore::new());
        let (queue, rx) = LocalQueue::new();

        let engine = Arc::new(TaskExecution::new(
            catalog.clone(),
            Arc::new(HttpAgentInvoker::new(agent_token)),
            Arc::new(queue),
            FlowTracker::new(store.clone()),
            TASK_TOPIC,
        ));

        (
            Self {
                catalog,
                store,
                engine,
            },
            rx,
        )
    }
}

/// Drain the local queue, handling each delivery on its own task so
/// sibling completions race the way a real bus would deliver them.
pub fn spawn_delivery_loop(
    engine: Arc<TaskExecution>,
    mut rx: mpsc::UnboundedReceiver<BusEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let kind = envelope.payload.task_kind.clone();
                if let Err(e) = engine.handle(envelope.payload).await {
                    tracing::error!("Delivery of '{}' failed: {}", kind, e);
                }
            });
        }
    })
}
