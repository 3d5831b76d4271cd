//! Public types for the delivery loop.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::record::RecordKind;

/// Delivery loop lifecycle state.
///
/// Use [`super::DeliveryLoop::state()`] to read the current state or
/// [`super::DeliveryLoop::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, not yet subscribed
    Idle,
    /// Opening a session on the substrate
    Connecting,
    /// Declaring the source (and dead-letter) channel
    Declaring,
    /// Receiving and handling deliveries
    Listening,
    /// Shutdown requested, finishing the in-flight delivery
    Stopping,
    /// Session closed after a cooperative shutdown
    Stopped,
    /// Session lost or setup failed
    Failed,
}

impl LoopState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Declaring => "declaring",
            Self::Listening => "listening",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Declaring => write!(f, "Declaring"),
            Self::Listening => write!(f, "Listening"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A logical channel and the record kind its payloads decode to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub name: String,
    pub kind: RecordKind,
}

impl ChannelBinding {
    pub fn new(name: impl Into<String>, kind: RecordKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// What happens to a delivery whose handler failed.
///
/// A failed delivery is never acknowledged unless it has first been copied
/// to the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Return a failed delivery to the channel immediately. When false the
    /// delivery stays unacknowledged until its lease expires or the session
    /// closes.
    pub requeue_on_failure: bool,
    /// Redeliveries allowed before a message counts as exhausted.
    pub max_redeliveries: u32,
    /// Where exhausted messages go. Without one they are only logged.
    pub dead_letter_channel: Option<String>,
}

impl RedeliveryPolicy {
    /// Whether a delivery seen `delivery_count` times has used up its redeliveries.
    #[must_use]
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count > self.max_redeliveries
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            requeue_on_failure: true,
            max_redeliveries: 5,
            dead_letter_channel: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("connection lost on channel '{channel}': {reason}")]
    Connection { channel: String, reason: String },
    #[error("cannot declare channel '{channel}': {reason}")]
    Declaration { channel: String, reason: String },
    #[error("channel '{channel}' already declared with durable={existing}, requested durable={requested}")]
    ConfigurationMismatch {
        channel: String,
        existing: bool,
        requested: bool,
    },
}

impl ConsumerError {
    /// Map a substrate error raised while serving `channel`.
    pub(crate) fn from_channel(channel: &str, e: ChannelError) -> Self {
        match e {
            ChannelError::ConfigurationMismatch {
                channel,
                existing,
                requested,
            } => Self::ConfigurationMismatch {
                channel,
                existing,
                requested,
            },
            ChannelError::Declaration { channel, reason } => Self::Declaration { channel, reason },
            other => Self::Connection {
                channel: channel.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Configuration errors cannot be fixed by reconnecting.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Connection { .. })
    }
}

/// Per-loop delivery counters.
#[derive(Debug, Default)]
pub struct LoopStats {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    left_unacked: AtomicU64,
    dead_lettered: AtomicU64,
    failures: AtomicU64,
}

impl LoopStats {
    pub(super) fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub(super) fn inc_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }
    pub(super) fn inc_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }
    pub(super) fn inc_left_unacked(&self) {
        self.left_unacked.fetch_add(1, Ordering::Relaxed);
    }
    pub(super) fn inc_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
    pub(super) fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn left_unacked(&self) -> u64 {
        self.left_unacked.load(Ordering::Relaxed)
    }
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
    /// Handler and decode failures, whatever the policy then did.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
