// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL channel substrate (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Every message is a row; a delivery is a lease on that row:
//!
//! ```sql
//! CREATE TABLE queue_messages (
//!   id BIGINT AUTO_INCREMENT PRIMARY KEY,  -- FIFO order
//!   channel VARCHAR(255) NOT NULL,
//!   payload MEDIUMBLOB NOT NULL,
//!   persistent BIGINT NOT NULL,
//!   delivery_count BIGINT NOT NULL DEFAULT 0, -- bumped on every claim
//!   session_id VARCHAR(64),                -- owner of the current lease
//!   leased_until BIGINT NOT NULL DEFAULT 0,-- unix millis
//!   enqueued_at BIGINT NOT NULL
//! )
//! ```
//!
//! A row is ready when it has no owner or its lease has expired. Claims are a
//! compare-and-set on `delivery_count`, so two sessions racing for the same
//! row cannot both win. Ack deletes the row; requeue and session close clear
//! the owner.
//!
//! Rows live in the database, so every channel is effectively durable and
//! every message persistent. The `durable` flag is still recorded and
//! checked so a conflicting redeclaration is reported.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::traits::{now_millis, Broker, BrokerSession, ChannelError, Delivery, DeliveryTag, SessionId};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on one startup connect attempt; sqlx keeps retrying a
/// refused connection until `acquire_timeout` otherwise.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

fn map_sqlx(e: sqlx::Error) -> ChannelError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            ChannelError::Connection(e.to_string())
        }
        other => ChannelError::Backend(other.to_string()),
    }
}

pub struct SqlBroker {
    pool: AnyPool,
    is_sqlite: bool,
    lease: Duration,
}

impl SqlBroker {
    /// Open the queue tables at `connection_string`, creating them if needed.
    /// Uses startup-mode retry with a bounded connect per attempt, so a wrong
    /// URL fails within seconds.
    pub async fn open(connection_string: &str, lease: Duration) -> Result<Self, ChannelError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_channel_connect", &RetryConfig::startup(), || async {
            let connect = AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string);
            match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, connect).await {
                Ok(pool) => pool.map_err(map_sqlx),
                Err(_) => Err(ChannelError::Connection(format!(
                    "no connection within {:?}",
                    CONNECT_ATTEMPT_TIMEOUT
                ))),
            }
        })
        .await?;

        let broker = Self { pool, is_sqlite, lease };
        if is_sqlite {
            broker.enable_wal_mode().await?;
        }
        broker.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL channel substrate ready");
        Ok(broker)
    }

    async fn enable_wal_mode(&self) -> Result<(), ChannelError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| ChannelError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), ChannelError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS queue_channels (
                    name TEXT PRIMARY KEY,
                    durable INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS queue_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    persistent INTEGER NOT NULL DEFAULT 1,
                    delivery_count INTEGER NOT NULL DEFAULT 0,
                    session_id TEXT,
                    leased_until INTEGER NOT NULL DEFAULT 0,
                    enqueued_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_queue_messages_channel ON queue_messages (channel, id)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS queue_channels (
                    name VARCHAR(255) PRIMARY KEY,
                    durable BIGINT NOT NULL,
                    created_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS queue_messages (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    channel VARCHAR(255) NOT NULL,
                    payload MEDIUMBLOB NOT NULL,
                    persistent BIGINT NOT NULL DEFAULT 1,
                    delivery_count BIGINT NOT NULL DEFAULT 0,
                    session_id VARCHAR(64),
                    leased_until BIGINT NOT NULL DEFAULT 0,
                    enqueued_at BIGINT NOT NULL,
                    INDEX idx_channel (channel, id),
                    INDEX idx_session (session_id)
                )
                "#,
            ]
        };

        for &sql in statements {
            retry("sql_channel_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)
            })
            .await?;
        }
        Ok(())
    }

    /// Messages stored on `channel`, leased or not.
    pub async fn depth(&self, channel: &str) -> Result<u64, ChannelError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE channel = ?")
            .bind(channel)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let n: i64 = row.try_get("n").map_err(map_sqlx)?;
        Ok(n as u64)
    }

    /// Close the pool. Sessions created from this broker stop working.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Broker for SqlBroker {
    fn name(&self) -> &'static str {
        if self.is_sqlite {
            "sqlite"
        } else {
            "mysql"
        }
    }

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, ChannelError> {
        if self.pool.is_closed() {
            return Err(ChannelError::Connection("connection pool closed".into()));
        }
        // Round-trip so an unreachable database fails here, not on first receive.
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_sqlx)?;

        let session = SqlSession {
            id: SessionId::new(),
            pool: self.pool.clone(),
            is_sqlite: self.is_sqlite,
            lease_ms: self.lease.as_millis() as i64,
            closed: AtomicBool::new(false),
        };
        debug!(session = %session.id, "SQL channel session opened");
        Ok(Box::new(session))
    }
}

pub struct SqlSession {
    id: SessionId,
    pool: AnyPool,
    is_sqlite: bool,
    lease_ms: i64,
    closed: AtomicBool,
}

impl SqlSession {
    fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChannelError::SessionClosed(self.id))
        } else {
            Ok(())
        }
    }

    fn parse_tag(&self, tag: &DeliveryTag) -> Result<i64, ChannelError> {
        if tag.session != self.id {
            return Err(ChannelError::WrongSession {
                tag: tag.clone(),
                owner: tag.session,
                session: self.id,
            });
        }
        tag.message_id
            .parse::<i64>()
            .map_err(|_| ChannelError::UnknownDelivery(tag.clone()))
    }

    async fn declared_durability(&self, channel: &str) -> Result<Option<bool>, ChannelError> {
        let row = sqlx::query("SELECT durable FROM queue_channels WHERE name = ?")
            .bind(channel)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let durable: i64 = row.try_get("durable").map_err(map_sqlx)?;
                Ok(Some(durable != 0))
            }
            None => Ok(None),
        }
    }

    /// Claim the oldest ready row on `channel`. Loops while other sessions
    /// win the race for the head row.
    async fn try_claim(&self, channel: &str) -> Result<Option<Delivery>, ChannelError> {
        let session = self.id.to_string();
        loop {
            let now = now_millis();
            let candidate = sqlx::query(
                "SELECT id, delivery_count, payload, persistent FROM queue_messages \
                 WHERE channel = ? AND (session_id IS NULL OR leased_until <= ?) \
                 ORDER BY id LIMIT 1",
            )
            .bind(channel)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

            let Some(row) = candidate else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id").map_err(map_sqlx)?;
            let seen: i64 = row.try_get("delivery_count").map_err(map_sqlx)?;
            let payload: Vec<u8> = row.try_get("payload").map_err(map_sqlx)?;
            let persistent: i64 = row.try_get("persistent").map_err(map_sqlx)?;

            let claimed = sqlx::query(
                "UPDATE queue_messages SET session_id = ?, leased_until = ?, delivery_count = delivery_count + 1 \
                 WHERE id = ? AND delivery_count = ? AND (session_id IS NULL OR leased_until <= ?)",
            )
            .bind(&session)
            .bind(now + self.lease_ms)
            .bind(id)
            .bind(seen)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

            if claimed.rows_affected() == 1 {
                let delivery_count = (seen + 1) as u32;
                return Ok(Some(Delivery {
                    tag: DeliveryTag {
                        session: self.id,
                        message_id: id.to_string(),
                        attempt: delivery_count,
                    },
                    channel: channel.to_string(),
                    payload,
                    redelivered: delivery_count > 1,
                    delivery_count,
                    persistent: persistent != 0,
                }));
            }
            debug!(channel, id, "Lost claim race, retrying");
        }
    }
}

#[async_trait]
impl BrokerSession for SqlSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn declare(&self, channel: &str, durable: bool) -> Result<(), ChannelError> {
        self.check_open()?;
        let sql = if self.is_sqlite {
            "INSERT OR IGNORE INTO queue_channels (name, durable, created_at) VALUES (?, ?, ?)"
        } else {
            "INSERT IGNORE INTO queue_channels (name, durable, created_at) VALUES (?, ?, ?)"
        };
        sqlx::query(sql)
            .bind(channel)
            .bind(durable as i64)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| ChannelError::Declaration {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        match self.declared_durability(channel).await? {
            Some(existing) if existing != durable => Err(ChannelError::ConfigurationMismatch {
                channel: channel.to_string(),
                existing,
                requested: durable,
            }),
            Some(_) => Ok(()),
            None => Err(ChannelError::Declaration {
                channel: channel.to_string(),
                reason: "declaration not visible after insert".into(),
            }),
        }
    }

    async fn publish(&self, channel: &str, payload: &[u8], persistent: bool) -> Result<(), ChannelError> {
        self.check_open()?;
        if self.declared_durability(channel).await?.is_none() {
            return Err(ChannelError::Publish {
                channel: channel.to_string(),
                reason: "channel not declared".into(),
            });
        }

        // Single attempt: the INSERT is not idempotent and the caller owns retries.
        sqlx::query("INSERT INTO queue_messages (channel, payload, persistent, enqueued_at) VALUES (?, ?, ?, ?)")
            .bind(channel)
            .bind(payload.to_vec())
            .bind(persistent as i64)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<Delivery>, ChannelError> {
        self.check_open()?;
        if self.declared_durability(channel).await?.is_none() {
            return Err(ChannelError::Declaration {
                channel: channel.to_string(),
                reason: "channel not declared".into(),
            });
        }

        let deadline = Instant::now() + wait;
        loop {
            self.check_open()?;
            if let Some(delivery) = self.try_claim(channel).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.check_open()?;
        let id = self.parse_tag(tag)?;
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND session_id = ? AND delivery_count = ?")
            .bind(id)
            .bind(self.id.to_string())
            .bind(tag.attempt as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(ChannelError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }

    async fn requeue(&self, tag: &DeliveryTag) -> Result<(), ChannelError> {
        self.check_open()?;
        let id = self.parse_tag(tag)?;
        let result = sqlx::query(
            "UPDATE queue_messages SET session_id = NULL, leased_until = 0 \
             WHERE id = ? AND session_id = ? AND delivery_count = ?",
        )
        .bind(id)
        .bind(self.id.to_string())
        .bind(tag.attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(ChannelError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let released = sqlx::query("UPDATE queue_messages SET session_id = NULL, leased_until = 0 WHERE session_id = ?")
            .bind(self.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if released.rows_affected() > 0 {
            debug!(session = %self.id, released = released.rows_affected(), "Released leases on close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_millis(100);

    fn db_url(dir: &TempDir) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display())
    }

    async fn open(dir: &TempDir) -> SqlBroker {
        SqlBroker::open(&db_url(dir), Duration::from_secs(30)).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();
        session.declare("q", true).await.unwrap();

        session.publish("q", b"one", true).await.unwrap();
        session.publish("q", b"two", true).await.unwrap();

        let d1 = session.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(d1.payload, b"one");
        assert_eq!(d1.delivery_count, 1);
        session.ack(&d1.tag).await.unwrap();

        let d2 = session.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(d2.payload, b"two");
        session.ack(&d2.tag).await.unwrap();

        assert_eq!(broker.depth("q").await.unwrap(), 0);
        assert!(session.receive("q", WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declare_mismatch() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();

        session.declare("q", true).await.unwrap();
        session.declare("q", true).await.unwrap();
        let err = session.declare("q", false).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConfigurationMismatch { existing: true, requested: false, .. }));
    }

    #[tokio::test]
    async fn test_double_ack_and_wrong_session() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let owner = broker.connect().await.unwrap();
        let other = broker.connect().await.unwrap();
        owner.declare("q", true).await.unwrap();
        owner.publish("q", b"x", true).await.unwrap();

        let d = owner.receive("q", WAIT).await.unwrap().unwrap();
        assert!(matches!(other.ack(&d.tag).await, Err(ChannelError::WrongSession { .. })));

        owner.ack(&d.tag).await.unwrap();
        assert!(matches!(owner.ack(&d.tag).await, Err(ChannelError::UnknownDelivery(_))));
    }

    #[tokio::test]
    async fn test_requeue_keeps_fifo_position() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();
        session.declare("q", true).await.unwrap();
        session.publish("q", b"first", true).await.unwrap();
        session.publish("q", b"second", true).await.unwrap();

        let d = session.receive("q", WAIT).await.unwrap().unwrap();
        session.requeue(&d.tag).await.unwrap();

        let again = session.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(again.payload, b"first");
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_close_releases_leases_to_other_sessions() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let first = broker.connect().await.unwrap();
        first.declare("q", true).await.unwrap();
        first.publish("q", b"x", true).await.unwrap();

        let _held = first.receive("q", WAIT).await.unwrap().unwrap();
        let second = broker.connect().await.unwrap();
        assert!(second.receive("q", WAIT).await.unwrap().is_none());

        first.close().await.unwrap();
        let d = second.receive("q", WAIT).await.unwrap().unwrap();
        assert!(d.redelivered);
        second.ack(&d.tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let broker = SqlBroker::open(&db_url(&dir), Duration::from_millis(30)).await.unwrap();
        let crashed = broker.connect().await.unwrap();
        crashed.declare("q", true).await.unwrap();
        crashed.publish("q", b"x", true).await.unwrap();
        let stale = crashed.receive("q", WAIT).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let survivor = broker.connect().await.unwrap();
        let d = survivor.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(d.delivery_count, 2);
        assert!(matches!(crashed.ack(&stale.tag).await, Err(ChannelError::UnknownDelivery(_))));
        survivor.ack(&d.tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let broker = open(&dir).await;
            let session = broker.connect().await.unwrap();
            session.declare("q", true).await.unwrap();
            session.publish("q", b"kept", true).await.unwrap();
            broker.shutdown().await;
        }

        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();
        session.declare("q", true).await.unwrap();
        let d = session.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(d.payload, b"kept");
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();
        session.declare("q", true).await.unwrap();
        sqlx::query("DROP TABLE queue_messages").execute(&broker.pool).await.unwrap();

        let start = Instant::now();
        let err = session.publish("q", b"lost", true).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ChannelError::Backend(_)), "unexpected error: {err:?}");
        // A retry would have slept at least 100ms before the second attempt.
        assert!(elapsed < Duration::from_millis(100), "publish took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_publish_requires_declaration() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let session = broker.connect().await.unwrap();
        assert!(matches!(
            session.publish("missing", b"x", true).await,
            Err(ChannelError::Publish { .. })
        ));
    }
}
