//! Channel gateway: session lifecycle against one substrate.
//!
//! The gateway is an owned handle, cloned into whichever component needs it.
//! The enqueue path opens a short-lived session per publish; a delivery loop
//! holds one session for as long as it listens.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::channel::memory::MemoryBroker;
use crate::channel::redis::RedisBroker;
use crate::channel::sql::SqlBroker;
use crate::channel::{Broker, BrokerSession, ChannelError};
use crate::config::IngestConfig;
use crate::metrics;

#[derive(Clone)]
pub struct ChannelGateway {
    broker: Arc<dyn Broker>,
}

impl ChannelGateway {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.broker.name()
    }

    /// Open a session on the substrate.
    pub async fn open(&self) -> Result<Box<dyn BrokerSession>, ChannelError> {
        match self.broker.connect().await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(backend = self.broker.name(), error = %e, "Failed to open channel session");
                metrics::record_connection_error(self.broker.name());
                Err(e)
            }
        }
    }

    /// Declare `name` on `session`. A matching existing declaration is a no-op.
    pub async fn declare_channel(&self, session: &dyn BrokerSession, name: &str, durable: bool) -> Result<(), ChannelError> {
        session.declare(name, durable).await?;
        debug!(channel = name, durable, "Channel declared");
        Ok(())
    }

    /// Release a session. Safe after failures and when already closed.
    pub async fn close(&self, session: &dyn BrokerSession) {
        if let Err(e) = session.close().await {
            // Leases held by the session still expire and return their messages.
            warn!(session = %session.id(), error = %e, "Channel session did not close cleanly");
        }
    }
}

/// Build the substrate named by `url`.
///
/// | scheme | substrate |
/// |---|---|
/// | `memory:` | [`MemoryBroker`] (process-local) |
/// | `sqlite:` / `mysql:` | [`SqlBroker`] |
/// | `redis:` / `rediss:` | [`RedisBroker`] |
pub async fn connect_broker(url: &str, config: &IngestConfig) -> Result<Arc<dyn Broker>, ChannelError> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "memory" => Ok(Arc::new(MemoryBroker::with_lease(config.lease()))),
        "sqlite" | "mysql" => Ok(Arc::new(SqlBroker::open(url, config.lease()).await?)),
        "redis" | "rediss" => Ok(Arc::new(RedisBroker::new(
            url,
            &config.redis_prefix,
            &config.consumer_group,
            config.lease(),
        )?)),
        _ => Err(ChannelError::Connection(format!("unsupported channel substrate URL '{}'", url))),
    }
}
