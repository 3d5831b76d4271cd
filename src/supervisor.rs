//! Reconnect supervisor for delivery loops.
//!
//! A [`DeliveryLoop`] ends as soon as its session is lost. The supervisor
//! subscribes it again with exponential backoff until shutdown is signalled.
//! Configuration errors (a channel declared with other settings, a refused
//! declaration) are returned instead of retried.

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::consumer::{ConsumerError, DeliveryLoop, LoopState};
use crate::metrics;
use crate::resilience::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct Supervisor {
    retry: RetryConfig,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(RetryConfig::daemon())
    }
}

impl Supervisor {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Keep `delivery_loop` subscribed until `shutdown` turns true.
    ///
    /// Backoff starts over once a subscription has reached
    /// [`LoopState::Listening`]. With a bounded [`RetryConfig`] the last
    /// connection error is returned when the retries run out.
    #[tracing::instrument(skip(self, delivery_loop, shutdown), fields(channel = %delivery_loop.binding().name))]
    pub async fn run(&self, delivery_loop: &DeliveryLoop, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let channel = delivery_loop.binding().name.as_str();
        let mut backoff = self.retry.backoff();

        loop {
            let (result, reached_listening) = Self::subscribe_once(delivery_loop, shutdown.clone()).await;

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Delivery loop stopped on a configuration error");
                    return Err(e);
                }
                Err(e) => e,
            };

            if reached_listening {
                backoff.reset();
            }
            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempts(), error = %err, "Giving up reconnecting delivery loop");
                return Err(err);
            };

            warn!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery loop disconnected, reconnecting"
            );
            metrics::record_reconnect(channel);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown during reconnect backoff");
                    return Ok(());
                }
            }
        }
    }

    /// Run one subscription, noting whether it ever reached `Listening`.
    async fn subscribe_once(
        delivery_loop: &DeliveryLoop,
        shutdown: watch::Receiver<bool>,
    ) -> (Result<(), ConsumerError>, bool) {
        let mut state_rx = delivery_loop.state_receiver();
        let _ = state_rx.borrow_and_update();
        let mut reached_listening = false;
        let mut watching = true;

        let run = delivery_loop.subscribe(shutdown);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => return (result, reached_listening),
                changed = state_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *state_rx.borrow_and_update() == LoopState::Listening {
                        reached_listening = true;
                        watching = false;
                    }
                }
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
