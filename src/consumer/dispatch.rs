//! Per-delivery protocol: decode, handle, then ack or apply the redelivery policy.

use std::time::Instant;
use tracing::{debug, error, warn};

use crate::channel::{BrokerSession, ChannelError, Delivery};
use crate::metrics;
use crate::persistence::PersistError;
use crate::record::Record;

use super::{ConsumerError, DeliveryLoop};

impl DeliveryLoop {
    /// Settle one delivery. Only a lost session is an error; everything
    /// else is logged and counted here.
    pub(super) async fn dispatch(&self, session: &dyn BrokerSession, delivery: Delivery) -> Result<(), ConsumerError> {
        let channel = self.binding.name.as_str();
        self.stats.inc_received();
        if delivery.redelivered {
            metrics::record_redelivery(channel);
        }

        let start = Instant::now();
        let outcome = match Record::decode(self.binding.kind, &delivery.payload) {
            Ok(record) => self.handler.handle(record).await,
            Err(e) => Err(PersistError::from(e)),
        };
        metrics::record_handler_latency(channel, start.elapsed());

        match outcome {
            Ok(()) => self.acknowledge(session, &delivery).await,
            Err(e) => self.on_failure(session, &delivery, e).await,
        }
    }

    async fn acknowledge(&self, session: &dyn BrokerSession, delivery: &Delivery) -> Result<(), ConsumerError> {
        let channel = self.binding.name.as_str();
        match session.ack(&delivery.tag).await {
            Ok(()) => {
                self.stats.inc_acked();
                metrics::record_delivery(channel, "acked");
                debug!(delivery_tag = %delivery.tag, delivery_count = delivery.delivery_count, "Delivery acknowledged");
                Ok(())
            }
            Err(e) => self.settle_error(delivery, "ack", e),
        }
    }

    async fn on_failure(&self, session: &dyn BrokerSession, delivery: &Delivery, err: PersistError) -> Result<(), ConsumerError> {
        let channel = self.binding.name.as_str();
        let failure = err.kind();
        self.stats.inc_failures();
        metrics::record_handler_failure(channel, failure.as_str());

        if self.policy.is_exhausted(delivery.delivery_count) {
            match &self.policy.dead_letter_channel {
                Some(dlq) => {
                    if self.dead_letter(session, delivery, dlq, &err).await? {
                        return Ok(());
                    }
                }
                None => {
                    metrics::record_delivery(channel, "poison");
                    error!(
                        channel,
                        delivery_tag = %delivery.tag,
                        delivery_count = delivery.delivery_count,
                        failure = %failure,
                        error = %err,
                        "Poison message: redeliveries exhausted and no dead-letter channel configured"
                    );
                }
            }
        }

        if self.policy.requeue_on_failure {
            match session.requeue(&delivery.tag).await {
                Ok(()) => {
                    self.stats.inc_requeued();
                    metrics::record_delivery(channel, "requeued");
                    warn!(
                        channel,
                        delivery_tag = %delivery.tag,
                        delivery_count = delivery.delivery_count,
                        failure = %failure,
                        error = %err,
                        "Handler failed, delivery requeued"
                    );
                    // The requeued delivery is ready again at once.
                    tokio::task::yield_now().await;
                    Ok(())
                }
                Err(e) => self.settle_error(delivery, "requeue", e),
            }
        } else {
            self.stats.inc_left_unacked();
            metrics::record_delivery(channel, "unacked");
            warn!(
                channel,
                delivery_tag = %delivery.tag,
                delivery_count = delivery.delivery_count,
                failure = %failure,
                error = %err,
                "Handler failed, delivery left unacknowledged"
            );
            Ok(())
        }
    }

    /// Copy the payload to `dlq`, then ack the original. `Ok(false)` means
    /// the copy failed and the delivery is still unsettled.
    async fn dead_letter(
        &self,
        session: &dyn BrokerSession,
        delivery: &Delivery,
        dlq: &str,
        err: &PersistError,
    ) -> Result<bool, ConsumerError> {
        let channel = self.binding.name.as_str();
        if let Err(e) = session.publish(dlq, &delivery.payload, true).await {
            if e.is_connection_loss() {
                return Err(ConsumerError::from_channel(channel, e));
            }
            error!(
                channel,
                dead_letter_channel = dlq,
                delivery_tag = %delivery.tag,
                error = %e,
                "Dead-letter publish failed, keeping delivery"
            );
            return Ok(false);
        }

        match session.ack(&delivery.tag).await {
            Ok(()) => {
                self.stats.inc_dead_lettered();
                metrics::record_delivery(channel, "dead_lettered");
                warn!(
                    channel,
                    dead_letter_channel = dlq,
                    delivery_tag = %delivery.tag,
                    delivery_count = delivery.delivery_count,
                    failure = %err.kind(),
                    error = %err,
                    "Redeliveries exhausted, message dead-lettered"
                );
                Ok(true)
            }
            // The copy is already out; the original comes back later.
            Err(e) => self.settle_error(delivery, "ack", e).map(|()| true),
        }
    }

    /// A settle call failed. A lost session ends the loop; a tag that is no
    /// longer ours (its lease expired) only means someone else has it now.
    fn settle_error(&self, delivery: &Delivery, op: &'static str, e: ChannelError) -> Result<(), ConsumerError> {
        if e.is_connection_loss() {
            return Err(ConsumerError::from_channel(&self.binding.name, e));
        }
        warn!(
            channel = %self.binding.name,
            delivery_tag = %delivery.tag,
            delivery_count = delivery.delivery_count,
            op,
            error = %e,
            "Could not settle delivery"
        );
        Ok(())
    }
}
