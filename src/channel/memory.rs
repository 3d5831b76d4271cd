//! In-process channel substrate.
//!
//! Keeps every channel as an ordered ready queue plus a table of leased
//! (delivered, unsettled) messages. Useful for tests and single-process
//! deployments. [`MemoryBroker::restart`] models a substrate restart: durable
//! channels and persistent messages survive it, everything else is lost, and
//! all live sessions are invalidated.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use super::traits::{Broker, BrokerSession, ChannelError, Delivery, DeliveryTag, SessionId};

/// Upper bound on how long a waiting receiver sleeps between checks, so
/// expired leases are noticed without a publish to wake it.
const POLL_STEP: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    payload: Vec<u8>,
    persistent: bool,
    delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    session: SessionId,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, Lease>,
}

impl ChannelState {
    /// Put a message back in sequence order so redeliveries keep FIFO order.
    fn return_to_ready(&mut self, message: StoredMessage) {
        let pos = self.ready.partition_point(|m| m.seq < message.seq);
        self.ready.insert(pos, message);
    }

    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &expired {
            if let Some(lease) = self.in_flight.remove(seq) {
                self.return_to_ready(lease.message);
            }
        }
        expired.len()
    }

    fn release_session(&mut self, session: SessionId) -> usize {
        let owned: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.session == session)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &owned {
            if let Some(lease) = self.in_flight.remove(seq) {
                self.return_to_ready(lease.message);
            }
        }
        owned.len()
    }
}

#[derive(Debug)]
struct BrokerState {
    /// Bumped on every restart; sessions from an older epoch are dead.
    epoch: u64,
    available: bool,
    next_seq: u64,
    channels: HashMap<String, ChannelState>,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker. Cloning shares the same substrate.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    lease: Duration,
}

impl MemoryBroker {
    /// Default visibility timeout for unsettled deliveries.
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new() -> Self {
        Self::with_lease(Self::DEFAULT_LEASE)
    }

    /// Create a broker whose unsettled deliveries become ready again after `lease`.
    #[must_use]
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    epoch: 0,
                    available: true,
                    next_seq: 1,
                    channels: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
            lease,
        }
    }

    /// Simulate a substrate restart.
    pub fn restart(&self) {
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        state.channels.retain(|_, ch| ch.durable);
        for channel in state.channels.values_mut() {
            let leases: Vec<Lease> = channel.in_flight.drain().map(|(_, l)| l).collect();
            for lease in leases {
                channel.return_to_ready(lease.message);
            }
            channel.ready.retain(|m| m.persistent);
        }
        info!(epoch = state.epoch, "Memory broker restarted");
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Toggle substrate reachability. While unavailable, `connect` fails.
    pub fn set_available(&self, available: bool) {
        self.shared.state.lock().available = available;
    }

    /// Messages waiting for delivery on `channel`.
    #[must_use]
    pub fn ready_len(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |ch| ch.ready.len())
    }

    /// Messages delivered but not yet settled on `channel`.
    #[must_use]
    pub fn unacked_len(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |ch| ch.in_flight.len())
    }

    #[must_use]
    pub fn is_declared(&self, channel: &str) -> bool {
        self.shared.state.lock().channels.contains_key(channel)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, ChannelError> {
        let state = self.shared.state.lock();
        if !state.available {
            return Err(ChannelError::Connection("memory broker unavailable".into()));
        }
        let session = MemorySession {
            id: SessionId::new(),
            epoch: state.epoch,
            shared: self.shared.clone(),
            lease: self.lease,
            closed: AtomicBool::new(false),
        };
        debug!(session = %session.id, "Memory session opened");
        Ok(Box::new(session))
    }
}

pub struct MemorySession {
    id: SessionId,
    epoch: u64,
    shared: Arc<Shared>,
    lease: Duration,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_live(&self, state: &BrokerState) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::SessionClosed(self.id));
        }
        if state.epoch != self.epoch {
            return Err(ChannelError::Connection("substrate restarted, session lost".into()));
        }
        Ok(())
    }

    fn check_owner(&self, tag: &DeliveryTag) -> Result<u64, ChannelError> {
        if tag.session != self.id {
            return Err(ChannelError::WrongSession {
                tag: tag.clone(),
                owner: tag.session,
                session: self.id,
            });
        }
        tag.message_id
            .parse::<u64>()
            .map_err(|_| ChannelError::UnknownDelivery(tag.clone()))
    }

    /// Remove the lease matching `tag`, returning its channel name and message.
    fn take_lease(
        &self,
        state: &mut BrokerState,
        tag: &DeliveryTag,
    ) -> Result<(String, StoredMessage), ChannelError> {
        let seq = self.check_owner(tag)?;
        for (name, channel) in state.channels.iter_mut() {
            let matches = channel.in_flight.get(&seq).is_some_and(|lease| {
                lease.session == self.id && lease.message.delivery_count == tag.attempt
            });
            if matches {
                if let Some(lease) = channel.in_flight.remove(&seq) {
                    return Ok((name.clone(), lease.message));
                }
            }
        }
        Err(ChannelError::UnknownDelivery(tag.clone()))
    }

    fn try_receive(&self, channel: &str) -> Result<Option<Delivery>, ChannelError> {
        let mut state = self.shared.state.lock();
        self.check_live(&state)?;
        let Some(ch) = state.channels.get_mut(channel) else {
            return Err(ChannelError::Declaration {
                channel: channel.to_string(),
                reason: "channel not declared".into(),
            });
        };

        let now = Instant::now();
        ch.reclaim_expired(now);
        let Some(mut message) = ch.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;

        let delivery = Delivery {
            tag: DeliveryTag {
                session: self.id,
                message_id: message.seq.to_string(),
                attempt: message.delivery_count,
            },
            channel: channel.to_string(),
            payload: message.payload.clone(),
            redelivered: message.delivery_count > 1,
            delivery_count: message.delivery_count,
            persistent: message.persistent,
        };
        ch.in_flight.insert(
            message.seq,
            Lease {
                message,
                session: self.id,
                expires_at: now + self.lease,
            },
        );
        Ok(Some(delivery))
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn declare(&self, channel: &str, durable: bool) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        self.check_live(&state)?;
        match state.channels.get(channel) {
            Some(existing) if existing.durable != durable => Err(ChannelError::ConfigurationMismatch {
                channel: channel.to_string(),
                existing: existing.durable,
                requested: durable,
            }),
            Some(_) => Ok(()),
            None => {
                state.channels.insert(
                    channel.to_string(),
                    ChannelState {
                        durable,
                        ..Default::default()
                    },
                );
                debug!(channel, durable, "Channel declared");
                Ok(())
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &[u8], persistent: bool) -> Result<(), ChannelError> {
        {
            let mut state = self.shared.state.lock();
            self.check_live(&state)?;
            let seq = state.next_seq;
            let Some(ch) = state.channels.get_mut(channel) else {
                return Err(ChannelError::Publish {
                    channel: channel.to_string(),
                    reason: "channel not declared".into(),
                });
            };
            ch.ready.push_back(StoredMessage {
                seq,
                payload: payload.to_vec(),
                persistent,
                delivery_count: 0,
            });
            state.next_seq += 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.notify.notified();
            if let Some(delivery) = self.try_receive(channel)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let step = (deadline - now).min(POLL_STEP);
            let _ = tokio::time::timeout(step, notified).await;
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        self.check_live(&state)?;
        self.take_lease(&mut state, tag)?;
        Ok(())
    }

    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        {
            let mut state = self.shared.state.lock();
            self.check_live(&state)?;
            let (channel, message) = self.take_lease(&mut state, tag)?;
            if let Some(ch) = state.channels.get_mut(&channel) {
                ch.return_to_ready(message);
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let released = {
            let mut state = self.shared.state.lock();
            if state.epoch != self.epoch {
                // Restart already returned everything this session held.
                0
            } else {
                state
                    .channels
                    .values_mut()
                    .map(|ch| ch.release_session(self.id))
                    .sum()
            }
        };
        if released > 0 {
            debug!(session = %self.id, released, "Returned unsettled deliveries on close");
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}
