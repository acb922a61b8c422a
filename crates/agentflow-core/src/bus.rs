//! Message bus port and the local development queue.
//!
//! The broker only consumes a narrow contract: publish an envelope to a
//! topic, and decode a raw delivery back into an envelope. The local dev
//! queue carries envelopes over an in-process channel; push-style brokers
//! deliver a wrapper object whose `data` field is base64-encoded JSON.

use crate::error::{BrokerError, Result};
use crate::task::{AgentTaskRequest, CorrelationId};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The only message type the broker publishes.
pub const TASK_MESSAGE_TYPE: &str = "task";

/// Envelope stored on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub cid: CorrelationId,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub payload: AgentTaskRequest,
}

impl BusEnvelope {
    /// Wrap a task for publication, stamped now.
    pub fn task(cid: CorrelationId, payload: AgentTaskRequest) -> Self {
        Self {
            message_type: TASK_MESSAGE_TYPE.to_string(),
            cid,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Decode a raw delivery: either the envelope JSON itself (local
    /// queue) or a push wrapper `{"message": {"data": <base64(JSON)>}}`.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| BrokerError::Validation(format!("undecodable bus delivery: {}", e)))?;

        if value.get("message").is_some() {
            let wrapper: PushDelivery = serde_json::from_value(value)
                .map_err(|e| BrokerError::Validation(format!("malformed push delivery: {}", e)))?;
            let bytes = BASE64.decode(wrapper.message.data.as_bytes()).map_err(|e| {
                BrokerError::Validation(format!("push delivery data is not base64: {}", e))
            })?;
            return serde_json::from_slice(&bytes)
                .map_err(|e| BrokerError::Validation(format!("malformed bus envelope: {}", e)));
        }

        serde_json::from_value(value)
            .map_err(|e| BrokerError::Validation(format!("malformed bus envelope: {}", e)))
    }

    /// Encode as a push-style delivery body.
    pub fn to_push_payload(&self) -> Result<serde_json::Value> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| BrokerError::Bus(format!("envelope encode failed: {}", e)))?;
        Ok(serde_json::json!({
            "message": {"data": BASE64.encode(bytes)}
        }))
    }
}

#[derive(Debug, Deserialize)]
struct PushDelivery {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

/// Publication side of the bus contract.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: BusEnvelope) -> Result<()>;
}

/// In-process queue for local development and tests. The server drains
/// the receiver in a background loop and feeds deliveries to the engine.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<BusEnvelope>,
}

impl LocalQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageBus for LocalQueue {
    async fn publish(&self, topic: &str, envelope: BusEnvelope) -> Result<()> {
        tracing::debug!(
            "Publishing task {:?} to local topic '{}'",
            envelope.payload.task_instance_id,
            topic
        );
        self.tx
            .send(envelope)
            .map_err(|_| BrokerError::Bus("local queue receiver dropped".to_string()))
    }
}
