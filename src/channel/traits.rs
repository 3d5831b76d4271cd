use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Cannot reach channel substrate: {0}")]
    Connection(String),
    #[error("Failed to declare channel '{channel}': {reason}")]
    Declaration { channel: String, reason: String },
    #[error("Channel '{channel}' already declared with durable={existing}, requested durable={requested}")]
    ConfigurationMismatch {
        channel: String,
        existing: bool,
        requested: bool,
    },
    #[error("Publish to '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("Unknown or already settled delivery {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("Delivery {tag} belongs to session {owner}, not {session}")]
    WrongSession {
        tag: DeliveryTag,
        owner: SessionId,
        session: SessionId,
    },
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),
    #[error("Channel backend error: {0}")]
    Backend(String),
}

impl ChannelError {
    /// Whether the error means the link to the substrate is gone.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SessionClosed(_))
    }
}

/// Identity of one live connection/session to the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One-time handle used to settle a delivery.
///
/// Valid only on the session that received it. `attempt` pins the tag to a
/// single delivery of the message, so a tag from an earlier delivery cannot
/// settle a later one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub session: SessionId,
    /// Substrate-specific message identity (sequence number or stream id).
    pub message_id: String,
    pub attempt: u32,
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.message_id, self.attempt, self.session)
    }
}

/// A dequeued message plus the handle used to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub channel: String,
    pub payload: Vec<u8>,
    /// True when this message was delivered at least once before.
    pub redelivered: bool,
    /// Number of times the message has been delivered, this one included.
    pub delivery_count: u32,
    pub persistent: bool,
}

/// A channel substrate that hands out sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, ChannelError>;
}

/// A live session on a substrate.
///
/// Deliveries are manual-ack: a received message stays owned by the session
/// until it is acked, requeued, its lease expires, or the session closes.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Declare a channel. Idempotent when `durable` matches the existing
    /// declaration, otherwise [`ChannelError::ConfigurationMismatch`].
    async fn declare(&self, channel: &str, durable: bool) -> Result<(), ChannelError>;

    async fn publish(&self, channel: &str, payload: &[u8], persistent: bool) -> Result<(), ChannelError>;

    /// Receive the oldest ready message, waiting up to `wait`.
    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<Delivery>, ChannelError>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ChannelError>;

    /// Return a delivery to the ready set for immediate redelivery.
    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), ChannelError>;

    /// Release the session. Unsettled deliveries go back to the channel.
    /// Calling close more than once is a no-op.
    async fn close(&self) -> Result<(), ChannelError>;
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
