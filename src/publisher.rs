//! Enqueue path.
//!
//! Each publish opens a session, declares the channel durable, hands the
//! encoded body to the substrate as a persistent message and closes the
//! session again, on the error path too. Success means the substrate has
//! accepted the message, nothing more: no consumer has seen it yet.
//!
//! There is no retry here. A substrate outage surfaces as
//! [`PublishError::Connection`] and the caller decides whether to retry.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{BrokerSession, ChannelError};
use crate::gateway::ChannelGateway;
use crate::metrics;
use crate::record::{Record, RecordError, RecordKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("cannot reach channel substrate: {0}")]
    Connection(String),
    #[error("cannot declare channel '{channel}': {reason}")]
    Declaration { channel: String, reason: String },
    /// The caller's JSON is not a valid record of the requested kind.
    #[error("invalid record: {0}")]
    Invalid(RecordError),
    #[error("cannot encode record: {0}")]
    Encode(RecordError),
    #[error("publish to '{channel}' rejected: {reason}")]
    Rejected { channel: String, reason: String },
}

/// Confirmation that the substrate accepted a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub channel: String,
    pub bytes: usize,
}

fn declaration_error(channel: &str, e: ChannelError) -> PublishError {
    if e.is_connection_loss() {
        PublishError::Connection(e.to_string())
    } else {
        PublishError::Declaration {
            channel: channel.to_string(),
            reason: e.to_string(),
        }
    }
}

fn publish_error(channel: &str, e: ChannelError) -> PublishError {
    if e.is_connection_loss() {
        PublishError::Connection(e.to_string())
    } else {
        PublishError::Rejected {
            channel: channel.to_string(),
            reason: e.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    gateway: ChannelGateway,
}

impl Publisher {
    pub fn new(gateway: ChannelGateway) -> Self {
        Self { gateway }
    }

    /// Publish `record` to `channel`.
    #[tracing::instrument(skip(self, record), fields(kind = %record.kind()))]
    pub async fn publish(&self, channel: &str, record: &Record) -> Result<PublishAck, PublishError> {
        let payload = record.encode().map_err(PublishError::Encode)?;
        self.publish_payload(channel, &payload).await
    }

    /// Decode caller-supplied JSON as a `kind` record, then publish it.
    pub async fn publish_json(&self, channel: &str, kind: RecordKind, body: Value) -> Result<PublishAck, PublishError> {
        let record = Record::from_value(kind, body).map_err(PublishError::Invalid)?;
        self.publish(channel, &record).await
    }

    async fn publish_payload(&self, channel: &str, payload: &[u8]) -> Result<PublishAck, PublishError> {
        let session = self
            .gateway
            .open()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let result = self.publish_on(session.as_ref(), channel, payload).await;
        self.gateway.close(session.as_ref()).await;

        match &result {
            Ok(_) => {
                metrics::record_publish(channel, "success");
                debug!(channel, bytes = payload.len(), "Message accepted");
            }
            Err(e) => {
                metrics::record_publish(channel, "error");
                warn!(channel, error = %e, "Publish failed");
            }
        }
        result
    }

    async fn publish_on(&self, session: &dyn BrokerSession, channel: &str, payload: &[u8]) -> Result<PublishAck, PublishError> {
        self.gateway
            .declare_channel(session, channel, true)
            .await
            .map_err(|e| declaration_error(channel, e))?;
        session
            .publish(channel, payload, true)
            .await
            .map_err(|e| publish_error(channel, e))?;
        Ok(PublishAck {
            channel: channel.to_string(),
            bytes: payload.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryBroker;
    use crate::channel::Broker;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn publisher() -> (MemoryBroker, Publisher) {
        let memory = MemoryBroker::new();
        let publisher = Publisher::new(ChannelGateway::new(Arc::new(memory.clone())));
        (memory, publisher)
    }

    fn alice() -> Value {
        json!({"name": "Alice", "email": "a@x.com", "phone": "555-0100"})
    }

    #[tokio::test]
    async fn test_publish_declares_and_enqueues() {
        let (memory, publisher) = publisher();
        let ack = publisher
            .publish_json("customer_queue", RecordKind::Customer, alice())
            .await
            .unwrap();
        assert_eq!(ack.channel, "customer_queue");
        assert!(ack.bytes > 0);
        assert_eq!(memory.ready_len("customer_queue"), 1);

        // Payload is the bare body, no envelope.
        let session = memory.connect().await.unwrap();
        let d = session.receive("customer_queue", Duration::from_millis(50)).await.unwrap().unwrap();
        let body: Value = serde_json::from_slice(&d.payload).unwrap();
        assert_eq!(body, alice());
        assert!(d.persistent);
    }

    #[tokio::test]
    async fn test_publish_invalid_json_is_rejected_before_enqueue() {
        let (memory, publisher) = publisher();
        let err = publisher
            .publish_json("customer_queue", RecordKind::Customer, json!({"name": "Alice"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Invalid(RecordError::Validation { .. })));
        assert_eq!(memory.ready_len("customer_queue"), 0);
    }

    #[tokio::test]
    async fn test_publish_during_outage_is_connection_error() {
        let (memory, publisher) = publisher();
        memory.set_available(false);
        let err = publisher
            .publish_json("customer_queue", RecordKind::Customer, alice())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Connection(_)));
    }

    #[tokio::test]
    async fn test_publish_to_non_durable_channel_is_declaration_error() {
        let (memory, publisher) = publisher();
        let session = memory.connect().await.unwrap();
        session.declare("customer_queue", false).await.unwrap();

        let err = publisher
            .publish_json("customer_queue", RecordKind::Customer, alice())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Declaration { .. }));
    }

    #[tokio::test]
    async fn test_published_message_survives_restart() {
        let (memory, publisher) = publisher();
        publisher
            .publish_json("customer_queue", RecordKind::Customer, alice())
            .await
            .unwrap();
        memory.restart();
        assert_eq!(memory.ready_len("customer_queue"), 1);
    }
}
