//! Durable channel substrates.
//!
//! A substrate stores messages on named channels and hands them out with
//! manual acknowledgement. Three backends implement [`Broker`]:
//!
//! - [`memory::MemoryBroker`]: in-process, restart simulated
//! - [`sql::SqlBroker`]: rows in SQLite or MySQL with lease-based ownership
//! - [`redis::RedisBroker`]: one Redis Stream per channel with a consumer group

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use traits::{Broker, BrokerSession, ChannelError, Delivery, DeliveryTag, SessionId};
