//! Redis Streams channel substrate.
//!
//! Each channel is one stream read through a shared consumer group:
//!
//! ```text
//! {prefix}channels            HASH   channel -> "1" (durable) | "0"
//! {prefix}stream:{channel}    STREAM entries {payload, delivered, persistent}
//! ```
//!
//! - receive: first reclaims an entry whose owner has been idle longer than the
//!   lease (`XPENDING IDLE` + `XCLAIM`), otherwise `XREADGROUP ... >`
//! - ack: `XACK` + `XDEL`, after checking the entry is still pending for this
//!   consumer (XACK alone does not check ownership)
//! - requeue: re-append with `delivered` bumped, then ack the original. The
//!   message goes to the tail, so it loses its original position
//! - close: requeue everything this consumer still holds
//!
//! Durability is whatever the Redis server is configured for (AOF/RDB); the
//! `durable` flag is recorded for redeclaration checks only.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{Broker, BrokerSession, ChannelError, Delivery, DeliveryTag, SessionId};

fn map_redis(e: RedisError) -> ChannelError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        ChannelError::Connection(e.to_string())
    } else {
        ChannelError::Backend(e.to_string())
    }
}

pub struct RedisBroker {
    client: Client,
    prefix: String,
    group: String,
    lease: Duration,
}

impl RedisBroker {
    pub fn new(connection_string: &str, prefix: &str, group: &str, lease: Duration) -> Result<Self, ChannelError> {
        let client = Client::open(connection_string).map_err(map_redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            group: group.to_string(),
            lease,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, ChannelError> {
        let connection = ConnectionManager::new(self.client.clone()).await.map_err(map_redis)?;
        let session = RedisSession {
            id: SessionId::new(),
            connection,
            prefix: self.prefix.clone(),
            group: self.group.clone(),
            lease_ms: self.lease.as_millis() as u64,
            in_flight: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        debug!(session = %session.id, "Redis channel session opened");
        Ok(Box::new(session))
    }
}

#[derive(Debug, Clone)]
struct Held {
    key: String,
    delivery_count: u32,
    payload: Vec<u8>,
    persistent: bool,
}

pub struct RedisSession {
    id: SessionId,
    connection: ConnectionManager,
    prefix: String,
    group: String,
    lease_ms: u64,
    /// Stream entry id -> delivery held by this session.
    in_flight: Mutex<HashMap<String, Held>>,
    /// Streams where this session has registered as a group consumer.
    streams: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

/// Total deliveries of a stream entry: deliveries of earlier copies plus the
/// group's delivery counter for this copy.
fn delivery_count(earlier: u32, times_delivered: u32) -> u32 {
    earlier + times_delivered.max(1)
}

impl RedisSession {
    fn channels_key(&self) -> String {
        format!("{}channels", self.prefix)
    }

    fn stream_key(&self, channel: &str) -> String {
        format!("{}stream:{}", self.prefix, channel)
    }

    fn consumer(&self) -> String {
        self.id.to_string()
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChannelError::SessionClosed(self.id))
        } else {
            Ok(())
        }
    }

    async fn is_declared(&self, channel: &str) -> Result<bool, ChannelError> {
        let mut conn = self.connection.clone();
        conn.hexists(self.channels_key(), channel).await.map_err(map_redis)
    }

    /// Look up a held delivery, checking the tag belongs to this session.
    fn held(&self, tag: &DeliveryTag) -> Result<Held, ChannelError> {
        if tag.session != self.id {
            return Err(ChannelError::WrongSession {
                tag: tag.clone(),
                owner: tag.session,
                session: self.id,
            });
        }
        match self.in_flight.lock().get(&tag.message_id) {
            Some(held) if held.delivery_count == tag.attempt => Ok(held.clone()),
            _ => Err(ChannelError::UnknownDelivery(tag.clone())),
        }
    }

    /// Whether `id` is still pending for this consumer. False once another
    /// consumer has claimed it after a lease expiry.
    async fn still_owned(&self, key: &str, id: &str) -> Result<bool, ChannelError> {
        let mut conn = self.connection.clone();
        let pending: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .arg(self.consumer())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(!pending.is_empty())
    }

    /// Remove this session's consumer from the group on `key`. Skipped while
    /// entries are still pending for it: deleting the consumer would drop
    /// them from the group's pending list.
    async fn remove_consumer(&self, key: &str) -> Result<bool, ChannelError> {
        let mut conn = self.connection.clone();
        let pending: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(self.consumer())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        if !pending.is_empty() {
            return Ok(false);
        }
        let _: i64 = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(key)
            .arg(&self.group)
            .arg(self.consumer())
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(true)
    }

    fn to_delivery(&self, channel: &str, entry: &StreamId, times_delivered: u32) -> Result<(Delivery, Held), ChannelError> {
        let payload: Vec<u8> = entry
            .get("payload")
            .ok_or_else(|| ChannelError::Backend(format!("stream entry {} has no payload", entry.id)))?;
        let earlier: u32 = entry.get("delivered").unwrap_or(0);
        let persistent = entry.get::<u8>("persistent").map_or(true, |p| p != 0);
        let count = delivery_count(earlier, times_delivered);

        let delivery = Delivery {
            tag: DeliveryTag {
                session: self.id,
                message_id: entry.id.clone(),
                attempt: count,
            },
            channel: channel.to_string(),
            payload: payload.clone(),
            redelivered: count > 1,
            delivery_count: count,
            persistent,
        };
        let held = Held {
            key: self.stream_key(channel),
            delivery_count: count,
            payload,
            persistent,
        };
        Ok((delivery, held))
    }

    /// Claim the oldest entry whose lease has run out.
    async fn reclaim_expired(&self, channel: &str) -> Result<Option<Delivery>, ChannelError> {
        let key = self.stream_key(channel);
        let mut conn = self.connection.clone();

        let stale: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(&key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.lease_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        let Some((id, previous_owner, _idle, times_delivered)) = stale.into_iter().next() else {
            return Ok(None);
        };

        self.streams.lock().insert(key.clone());
        let claimed: StreamClaimReply = conn
            .xclaim(&key, &self.group, self.consumer(), self.lease_ms, &[&id])
            .await
            .map_err(map_redis)?;
        let Some(entry) = claimed.ids.into_iter().next() else {
            return Ok(None);
        };

        debug!(channel, id = %entry.id, previous_owner = %previous_owner, "Reclaimed delivery with expired lease");
        let (delivery, held) = self.to_delivery(channel, &entry, times_delivered as u32 + 1)?;
        self.in_flight.lock().insert(entry.id.clone(), held);
        Ok(Some(delivery))
    }

    async fn read_new(&self, channel: &str, wait: Duration) -> Result<Option<Delivery>, ChannelError> {
        let key = self.stream_key(channel);
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, self.consumer())
            .count(1)
            .block(wait.as_millis().max(1) as usize);
        self.streams.lock().insert(key.clone());

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&key], &[">"], &options)
            .await
            .map_err(map_redis)?;
        let Some(entry) = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
        else {
            return Ok(None);
        };

        let (delivery, held) = self.to_delivery(channel, &entry, 1)?;
        self.in_flight.lock().insert(entry.id.clone(), held);
        Ok(Some(delivery))
    }

    /// Append a fresh copy of a held delivery and drop the original.
    async fn reappend(&self, id: &str, held: &Held) -> Result<(), ChannelError> {
        let mut conn = self.connection.clone();
        let _: () = pipe()
            .atomic()
            .cmd("XADD")
            .arg(&held.key)
            .arg("*")
            .arg("payload")
            .arg(held.payload.as_slice())
            .arg("delivered")
            .arg(held.delivery_count)
            .arg("persistent")
            .arg(u8::from(held.persistent))
            .ignore()
            .cmd("XACK")
            .arg(&held.key)
            .arg(&self.group)
            .arg(id)
            .ignore()
            .cmd("XDEL")
            .arg(&held.key)
            .arg(id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for RedisSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn declare(&self, channel: &str, durable: bool) -> Result<(), ChannelError> {
        self.check_open()?;
        let mut conn = self.connection.clone();
        let flag = if durable { "1" } else { "0" };

        let _: bool = conn
            .hset_nx(self.channels_key(), channel, flag)
            .await
            .map_err(map_redis)?;
        let existing: Option<String> = conn.hget(self.channels_key(), channel).await.map_err(map_redis)?;
        match existing.as_deref() {
            Some(f) if f != flag => {
                return Err(ChannelError::ConfigurationMismatch {
                    channel: channel.to_string(),
                    existing: f == "1",
                    requested: durable,
                })
            }
            Some(_) => {}
            None => {
                return Err(ChannelError::Declaration {
                    channel: channel.to_string(),
                    reason: "declaration not visible after write".into(),
                })
            }
        }

        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(self.stream_key(channel), &self.group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(ChannelError::Declaration {
                channel: channel.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn publish(&self, channel: &str, payload: &[u8], persistent: bool) -> Result<(), ChannelError> {
        self.check_open()?;
        if !self.is_declared(channel).await? {
            return Err(ChannelError::Publish {
                channel: channel.to_string(),
                reason: "channel not declared".into(),
            });
        }
        let mut conn = self.connection.clone();
        let _: String = cmd("XADD")
            .arg(self.stream_key(channel))
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("delivered")
            .arg(0)
            .arg("persistent")
            .arg(u8::from(persistent))
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }

    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<Delivery>, ChannelError> {
        self.check_open()?;
        if !self.is_declared(channel).await? {
            return Err(ChannelError::Declaration {
                channel: channel.to_string(),
                reason: "channel not declared".into(),
            });
        }
        if let Some(delivery) = self.reclaim_expired(channel).await? {
            return Ok(Some(delivery));
        }
        self.read_new(channel, wait).await
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.check_open()?;
        let held = self.held(tag)?;
        if !self.still_owned(&held.key, &tag.message_id).await? {
            self.in_flight.lock().remove(&tag.message_id);
            return Err(ChannelError::UnknownDelivery(tag.clone()));
        }

        let mut conn = self.connection.clone();
        let (acked, _deleted): (u64, u64) = pipe()
            .atomic()
            .cmd("XACK")
            .arg(&held.key)
            .arg(&self.group)
            .arg(&tag.message_id)
            .cmd("XDEL")
            .arg(&held.key)
            .arg(&tag.message_id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        self.in_flight.lock().remove(&tag.message_id);

        if acked == 0 {
            return Err(ChannelError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }

    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.check_open()?;
        let held = self.held(tag)?;
        if !self.still_owned(&held.key, &tag.message_id).await? {
            self.in_flight.lock().remove(&tag.message_id);
            return Err(ChannelError::UnknownDelivery(tag.clone()));
        }
        self.reappend(&tag.message_id, &held).await?;
        self.in_flight.lock().remove(&tag.message_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let held: Vec<(String, Held)> = self.in_flight.lock().drain().collect();
        for (id, h) in held {
            match self.still_owned(&h.key, &id).await {
                Ok(true) => {
                    if let Err(e) = self.reappend(&id, &h).await {
                        // Left pending; another consumer reclaims it after the lease.
                        warn!(id = %id, error = %e, "Failed to return delivery on close");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(id = %id, error = %e, "Failed to check delivery ownership on close"),
            }
        }

        let streams: Vec<String> = self.streams.lock().drain().collect();
        for key in streams {
            match self.remove_consumer(&key).await {
                Ok(true) => debug!(session = %self.id, stream = %key, "Removed group consumer"),
                Ok(false) => warn!(session = %self.id, stream = %key, "Consumer still has pending entries, kept"),
                Err(e) => warn!(session = %self.id, stream = %key, error = %e, "Failed to remove group consumer"),
            }
        }
        Ok(())
    }
}
