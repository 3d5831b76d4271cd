//! Delivery loop: one long-lived consumer per logical channel.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Connecting → Declaring → Listening ⇄ (handle → ack | policy)
//!                                     │
//!                     shutdown signal ↓             session lost
//!                                 Stopping → Stopped       → Failed
//! ```
//!
//! Deliveries are manual-ack. A delivery is acknowledged only after the
//! handler reports success, or after it has been copied to the dead-letter
//! channel. Every other failure leaves it with the substrate, which hands it
//! out again (see [`RedeliveryPolicy`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use queue_ingest::channel::memory::MemoryBroker;
//! use queue_ingest::consumer::{ChannelBinding, DeliveryLoop, RedeliveryPolicy};
//! use queue_ingest::gateway::ChannelGateway;
//! use queue_ingest::persistence::PersistenceAdapter;
//! use queue_ingest::record::RecordKind;
//! use queue_ingest::store::MemoryRecordStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = ChannelGateway::new(Arc::new(MemoryBroker::new()));
//! let adapter = Arc::new(PersistenceAdapter::new(Arc::new(MemoryRecordStore::new())));
//! let consumer = DeliveryLoop::new(
//!     gateway,
//!     ChannelBinding::new("customer_queue", RecordKind::Customer),
//!     adapter,
//!     RedeliveryPolicy::default(),
//! );
//!
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! consumer.subscribe(shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod lifecycle;
mod types;

pub use types::{ChannelBinding, ConsumerError, LoopState, LoopStats, RedeliveryPolicy};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::IngestConfig;
use crate::gateway::ChannelGateway;
use crate::persistence::RecordHandler;

/// Consumer for a single channel.
///
/// `subscribe` can be called again after it returns; each call opens a
/// fresh session. The [`crate::supervisor::Supervisor`] relies on this.
pub struct DeliveryLoop {
    gateway: ChannelGateway,
    binding: ChannelBinding,
    handler: Arc<dyn RecordHandler>,
    policy: RedeliveryPolicy,
    prefetch: usize,
    receive_wait: Duration,
    shutdown_grace: Duration,
    state: watch::Sender<LoopState>,
    state_rx: watch::Receiver<LoopState>,
    stats: LoopStats,
}

impl DeliveryLoop {
    pub fn new(
        gateway: ChannelGateway,
        binding: ChannelBinding,
        handler: Arc<dyn RecordHandler>,
        policy: RedeliveryPolicy,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        Self {
            gateway,
            binding,
            handler,
            policy,
            prefetch: 1,
            receive_wait: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
            state: state_tx,
            state_rx,
            stats: LoopStats::default(),
        }
    }

    /// Take prefetch, receive wait and shutdown grace from `config`.
    #[must_use]
    pub fn configured(self, config: &IngestConfig) -> Self {
        self.with_prefetch(config.prefetch)
            .with_receive_wait(config.receive_wait())
            .with_shutdown_grace(config.shutdown_grace())
    }

    /// Deliveries taken ahead of handling. They are still handled one at a
    /// time, in order.
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    #[must_use]
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    #[must_use]
    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LoopState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    fn set_state(&self, state: LoopState) {
        crate::metrics::set_loop_state(&self.binding.name, state.as_str());
        let _ = self.state.send(state);
    }
}
