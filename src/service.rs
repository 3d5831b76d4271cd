// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service wiring: one publisher, one store, one supervised loop per channel.
//!
//! The customer and order loops run as independent tasks. The only thing
//! they share is the record store (and through it, its connection pool).

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::{Broker, ChannelError};
use crate::config::{ConfigError, IngestConfig};
use crate::consumer::{ConsumerError, DeliveryLoop};
use crate::gateway::{connect_broker, ChannelGateway};
use crate::persistence::PersistenceAdapter;
use crate::publisher::{PublishAck, PublishError, Publisher};
use crate::record::RecordKind;
use crate::records::Records;
use crate::store::{MemoryRecordStore, RecordStore, SqlRecordStore, StoreError};
use crate::supervisor::Supervisor;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("delivery loop task failed: {0}")]
    Task(String),
}

pub struct IngestService {
    config: IngestConfig,
    gateway: ChannelGateway,
    publisher: Publisher,
    records: Records,
    adapter: Arc<PersistenceAdapter>,
    loops: Vec<Arc<DeliveryLoop>>,
    tasks: Vec<JoinHandle<Result<(), ConsumerError>>>,
    shutdown: watch::Sender<bool>,
}

impl IngestService {
    /// Build the substrate and store named in `config`, then start consuming.
    #[tracing::instrument(skip(config), fields(channel_url = %config.channel_url))]
    pub async fn start(config: IngestConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        // The SQL constructors carry their own startup retry.
        let broker = connect_broker(&config.channel_url, &config).await?;

        let store: Arc<dyn RecordStore> = match &config.store_url {
            Some(url) => Arc::new(SqlRecordStore::new(url).await?),
            None => Arc::new(MemoryRecordStore::new()),
        };

        Self::start_with(broker, store, config)
    }

    /// Start on an existing substrate and store.
    pub fn start_with(broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>, config: IngestConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        let gateway = ChannelGateway::new(broker);
        let publisher = Publisher::new(gateway.clone());
        let records = Records::new(store.clone());
        let adapter = Arc::new(PersistenceAdapter::new(store.clone()).check_order_references(config.check_order_references));
        let supervisor = Supervisor::new(config.reconnect_retry());
        let (shutdown_tx, _) = watch::channel(false);

        let mut loops = Vec::with_capacity(2);
        let mut tasks = Vec::with_capacity(2);
        for binding in config.bindings() {
            let delivery_loop = Arc::new(
                DeliveryLoop::new(gateway.clone(), binding, adapter.clone(), config.redelivery_policy()).configured(&config),
            );
            let task = tokio::spawn({
                let delivery_loop = delivery_loop.clone();
                let supervisor = supervisor.clone();
                let shutdown = shutdown_tx.subscribe();
                async move {
                    let result = supervisor.run(&delivery_loop, shutdown).await;
                    if let Err(e) = &result {
                        error!(channel = %delivery_loop.binding().name, error = %e, "Delivery loop terminated");
                    }
                    result
                }
            });
            loops.push(delivery_loop);
            tasks.push(task);
        }

        info!(
            backend = gateway.backend(),
            store = store.name(),
            customer_channel = %config.customer_channel,
            order_channel = %config.order_channel,
            "Ingest service started"
        );

        Ok(Self {
            config,
            gateway,
            publisher,
            records,
            adapter,
            loops,
            tasks,
            shutdown: shutdown_tx,
        })
    }

    #[must_use]
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    #[must_use]
    pub fn gateway(&self) -> &ChannelGateway {
        &self.gateway
    }

    #[must_use]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[must_use]
    pub fn records(&self) -> &Records {
        &self.records
    }

    #[must_use]
    pub fn adapter(&self) -> &PersistenceAdapter {
        &self.adapter
    }

    /// The loop consuming records of `kind`.
    #[must_use]
    pub fn delivery_loop(&self, kind: RecordKind) -> Option<&DeliveryLoop> {
        self.loops
            .iter()
            .find(|l| l.binding().kind == kind)
            .map(Arc::as_ref)
    }

    /// Enqueue caller JSON as a `kind` record on that kind's channel.
    pub async fn submit(&self, kind: RecordKind, body: Value) -> Result<PublishAck, PublishError> {
        self.publisher
            .publish_json(self.config.channel_for(kind), kind, body)
            .await
    }

    /// Signal every loop to stop and wait for them.
    ///
    /// Returns the first loop error, if a loop ended on one.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        info!("Stopping ingest service");
        let _ = self.shutdown.send(true);

        let mut first_error = None;
        for task in self.tasks {
            let outcome = match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ServiceError::Consumer(e)),
                Err(e) => Err(ServiceError::Task(e.to_string())),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }

        info!("Ingest service stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryBroker;
    use crate::consumer::LoopState;
    use serde_json::json;
    use std::time::Duration;

    fn quick_config() -> IngestConfig {
        IngestConfig {
            receive_wait_ms: 20,
            ..Default::default()
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = IngestConfig {
            prefetch: 0,
            ..Default::default()
        };
        assert!(matches!(IngestService::start(config).await, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_channel_fails_within_startup_budget() {
        let config = IngestConfig {
            channel_url: "mysql://root@127.0.0.1:1/none".into(),
            ..Default::default()
        };

        let start = std::time::Instant::now();
        let err = IngestService::start(config).await.err().unwrap();
        let elapsed = start.elapsed();

        assert!(matches!(err, ServiceError::Channel(ChannelError::Connection(_))), "unexpected error: {err}");
        // One startup retry: five bounded attempts plus about 3s of backoff.
        assert!(elapsed < Duration::from_secs(20), "startup took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_submit_reaches_store() {
        let service = IngestService::start(quick_config()).await.unwrap();
        service
            .submit(RecordKind::Customer, json!({"name": "Alice", "email": "a@x.com", "phone": "555-0100"}))
            .await
            .unwrap();

        let records = service.records().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while records.list(RecordKind::Customer).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_loop_per_channel() {
        let memory = MemoryBroker::new();
        let service =
            IngestService::start_with(Arc::new(memory.clone()), Arc::new(MemoryRecordStore::new()), quick_config())
                .unwrap();

        for kind in RecordKind::ALL {
            let lp = service.delivery_loop(kind).unwrap();
            wait_until(|| lp.state() == LoopState::Listening).await;
        }
        assert!(memory.is_declared("customer_queue"));
        assert!(memory.is_declared("order_queue"));

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_reports_fatal_loop_error() {
        let memory = MemoryBroker::new();
        let session = memory.connect().await.unwrap();
        session.declare("order_queue", false).await.unwrap();

        let service =
            IngestService::start_with(Arc::new(memory.clone()), Arc::new(MemoryRecordStore::new()), quick_config())
                .unwrap();
        let orders = service.delivery_loop(RecordKind::Order).unwrap();
        wait_until(|| orders.state() == LoopState::Failed).await;

        let err = service.shutdown().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Consumer(ConsumerError::ConfigurationMismatch { .. })
        ));
    }
}
