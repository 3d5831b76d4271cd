//! # Queue Ingest
//!
//! Queue-mediated write path for customer and order records.
//!
//! ## Architecture
//!
//! A write is accepted, enqueued on a durable channel and acknowledged to the
//! caller at once. Consumers take it off the channel, persist it, and only
//! then acknowledge the delivery:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Enqueue Path                          │
//! │  • Publisher: open session, declare durable, publish        │
//! │  • Caller sees Ack once the substrate holds the message     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Durable Channel                         │
//! │  • memory / SQLite / MySQL / Redis Streams                  │
//! │  • manual ack, leases, requeue, survives restart            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (one supervised loop per channel)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Delivery Loop                           │
//! │  • decode → handle → ack                                    │
//! │  • failure → requeue / leave unacked / dead-letter          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Persistence Adapter → Record Store            │
//! │  • required-field validation, unique email                  │
//! │  • circuit breaker around store calls                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once. A record whose handler fails is never
//! acknowledged unless it was first copied to the dead-letter channel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queue_ingest::{IngestConfig, IngestService, RecordKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = IngestConfig {
//!         channel_url: "sqlite://queue.db?mode=rwc".into(),
//!         store_url: Some("sqlite://records.db?mode=rwc".into()),
//!         dead_letter_channel: Some("ingest_dead_letter".into()),
//!         ..Default::default()
//!     };
//!
//!     let service = IngestService::start(config).await.expect("Failed to start");
//!
//!     service
//!         .submit(
//!             RecordKind::Customer,
//!             json!({"name": "Alice", "email": "a@x.com", "phone": "555-0100"}),
//!         )
//!         .await
//!         .expect("Failed to enqueue");
//!
//!     for customer in service.records().list(RecordKind::Customer).await.unwrap() {
//!         println!("{}", customer.to_document());
//!     }
//!
//!     service.shutdown().await.expect("Delivery loop failed");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: Durable channel substrates (memory, SQL, Redis)
//! - [`gateway`]: Session lifecycle against a substrate
//! - [`publisher`]: Enqueue path
//! - [`consumer`]: Delivery loop and redelivery policy
//! - [`supervisor`]: Reconnect with backoff
//! - [`persistence`]: Record handler writing to the store
//! - [`store`]: Record store backends
//! - [`records`]: Read-side CRUD
//! - [`resilience`]: Circuit breaker, retry logic

pub mod config;
pub mod record;
pub mod channel;
pub mod gateway;
pub mod publisher;
pub mod consumer;
pub mod supervisor;
pub mod persistence;
pub mod store;
pub mod records;
pub mod resilience;
pub mod service;
pub mod metrics;

pub use config::{ConfigError, IngestConfig};
pub use record::{Customer, Order, OrderItem, Record, RecordError, RecordKind};
pub use channel::{Broker, BrokerSession, ChannelError, Delivery, DeliveryTag, SessionId};
pub use gateway::{connect_broker, ChannelGateway};
pub use publisher::{PublishAck, PublishError, Publisher};
pub use consumer::{ChannelBinding, ConsumerError, DeliveryLoop, LoopState, LoopStats, RedeliveryPolicy};
pub use supervisor::Supervisor;
pub use persistence::{FailureKind, PersistError, PersistenceAdapter, RecordHandler};
pub use store::{MemoryRecordStore, RecordId, RecordStore, SqlRecordStore, StoreError, StoredRecord};
pub use records::{OrderWithCustomer, Records};
pub use service::{IngestService, ServiceError};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
