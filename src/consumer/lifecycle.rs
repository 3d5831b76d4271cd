//! Loop lifecycle: subscribe, listen, shutdown.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{BrokerSession, Delivery};

use super::{ConsumerError, DeliveryLoop, LoopState};

/// Resolves once shutdown is requested or the signal's sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl DeliveryLoop {
    /// Consume the bound channel until `shutdown` turns true.
    ///
    /// Returns `Ok(())` after a cooperative shutdown. Any loss of the session
    /// (or a setup failure) ends the call with an error; nothing here
    /// reconnects. Deliveries not yet acknowledged when the session closes
    /// go back to the channel.
    #[tracing::instrument(skip(self, shutdown), fields(channel = %self.binding.name))]
    pub async fn subscribe(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        if *shutdown.borrow() {
            self.set_state(LoopState::Stopped);
            return Ok(());
        }

        self.set_state(LoopState::Connecting);
        let session = match self.gateway.open().await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(LoopState::Failed);
                return Err(ConsumerError::from_channel(&self.binding.name, e));
            }
        };

        self.set_state(LoopState::Declaring);
        if let Err(e) = self.declare(session.as_ref()).await {
            self.gateway.close(session.as_ref()).await;
            self.set_state(LoopState::Failed);
            return Err(e);
        }

        self.set_state(LoopState::Listening);
        info!(session = %session.id(), prefetch = self.prefetch, "Listening for deliveries");

        let result = self.listen(session.as_ref(), &mut shutdown).await;
        self.gateway.close(session.as_ref()).await;

        match &result {
            Ok(()) => {
                self.set_state(LoopState::Stopped);
                info!(
                    received = self.stats.received(),
                    acked = self.stats.acked(),
                    "Delivery loop stopped"
                );
            }
            Err(e) => {
                self.set_state(LoopState::Failed);
                warn!(error = %e, "Delivery loop lost its session");
            }
        }
        result
    }

    async fn declare(&self, session: &dyn BrokerSession) -> Result<(), ConsumerError> {
        let channel = &self.binding.name;
        self.gateway
            .declare_channel(session, channel, true)
            .await
            .map_err(|e| ConsumerError::from_channel(channel, e))?;

        if let Some(dlq) = &self.policy.dead_letter_channel {
            self.gateway
                .declare_channel(session, dlq, true)
                .await
                .map_err(|e| ConsumerError::from_channel(dlq, e))?;
        }
        Ok(())
    }

    async fn listen(
        &self,
        session: &dyn BrokerSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        let channel = self.binding.name.as_str();
        let mut buffer: VecDeque<Delivery> = VecDeque::with_capacity(self.prefetch);

        loop {
            if *shutdown.borrow() {
                self.set_state(LoopState::Stopping);
                if !buffer.is_empty() {
                    debug!(buffered = buffer.len(), "Returning prefetched deliveries");
                }
                return Ok(());
            }

            if buffer.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => {
                        self.set_state(LoopState::Stopping);
                        return Ok(());
                    }
                    received = session.receive(channel, self.receive_wait) => {
                        match received.map_err(|e| ConsumerError::from_channel(channel, e))? {
                            Some(delivery) => buffer.push_back(delivery),
                            None => continue,
                        }
                    }
                }
                self.prefetch_more(session, &mut buffer).await?;
            }

            let Some(delivery) = buffer.pop_front() else {
                continue;
            };
            let tag = delivery.tag.clone();

            let handling = self.dispatch(session, delivery);
            tokio::pin!(handling);
            tokio::select! {
                biased;
                settled = &mut handling => settled?,
                _ = shutdown_requested(shutdown) => {
                    self.set_state(LoopState::Stopping);
                    return match tokio::time::timeout(self.shutdown_grace, &mut handling).await {
                        Ok(settled) => settled,
                        Err(_) => {
                            warn!(
                                delivery_tag = %tag,
                                grace_ms = self.shutdown_grace.as_millis() as u64,
                                "Shutdown grace elapsed, abandoning in-flight delivery"
                            );
                            Ok(())
                        }
                    };
                }
            }
        }
    }

    /// Top the buffer up to `prefetch` with whatever is ready right now.
    async fn prefetch_more(
        &self,
        session: &dyn BrokerSession,
        buffer: &mut VecDeque<Delivery>,
    ) -> Result<(), ConsumerError> {
        let channel = self.binding.name.as_str();
        while buffer.len() < self.prefetch {
            match session.receive(channel, Duration::ZERO).await {
                Ok(Some(delivery)) => buffer.push_back(delivery),
                Ok(None) => break,
                Err(e) => return Err(ConsumerError::from_channel(channel, e)),
            }
        }
        Ok(())
    }
}
