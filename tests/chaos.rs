//! Chaos Testing for Queue Ingest
//!
//! Failure scenarios driven by:
//! 1. **FailingRecordStore** - error injection at specific call numbers or
//!    while switched "down"
//! 2. **Substrate outages** - the memory broker going away and restarting
//!    while loops are consuming
//! 3. **Garbage payloads** - bytes on the channel that are not records
//!
//! Nothing is ever silently dropped: every record either lands in the store
//! or sits on a channel (source or dead-letter).
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use queue_ingest::channel::memory::MemoryBroker;
use queue_ingest::{
    Broker, BrokerSession, ChannelBinding, ChannelGateway, CircuitConfig, DeliveryLoop, IngestConfig,
    IngestService, LoopState, MemoryRecordStore, PersistenceAdapter, PublishError, Publisher, RecordKind,
    RecordStore, RedeliveryPolicy, StoreError, StoredRecord, Supervisor,
};

const CUSTOMERS: &str = "customer_queue";

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a store and fails selected calls.
pub struct FailingRecordStore<S: RecordStore> {
    inner: S,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call while set
    down: AtomicBool,
    error: StoreError,
}

impl<S: RecordStore> FailingRecordStore<S> {
    pub fn new(inner: S, fail_on_calls: Vec<u64>, error: StoreError) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            down: AtomicBool::new(false),
            error,
        }
    }

    /// A store that is down until [`Self::set_down`]`(false)`.
    pub fn down(inner: S) -> Self {
        let store = Self::new(inner, vec![], StoreError::Unavailable("injected outage".into()));
        store.down.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StoreError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count) {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for FailingRecordStore<S> {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn insert(&self, kind: RecordKind, body: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        self.maybe_fail()?;
        self.inner.insert(kind, body).await
    }

    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.maybe_fail()?;
        self.inner.find_by_id(kind, id).await
    }

    async fn find_by_unique_key(&self, kind: RecordKind, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.maybe_fail()?;
        self.inner.find_by_unique_key(kind, key).await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError> {
        self.inner.list(kind).await
    }

    async fn update(&self, kind: RecordKind, id: &str, patch: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        self.maybe_fail()?;
        self.inner.update(kind, id, patch).await
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        self.maybe_fail()?;
        self.inner.delete(kind, id).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn customer(n: usize) -> Value {
    json!({"name": format!("C{n}"), "email": format!("c{n}@x.com"), "phone": format!("555-{n:04}")})
}

async fn publish_customers(broker: &MemoryBroker, count: usize) {
    let publisher = Publisher::new(ChannelGateway::new(Arc::new(broker.clone())));
    for n in 0..count {
        publisher
            .publish_json(CUSTOMERS, RecordKind::Customer, customer(n))
            .await
            .unwrap();
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

async fn wait_for_customers(store: &dyn RecordStore, count: usize) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while store.list(RecordKind::Customer).await.unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {count} customers");
}

fn customer_loop(broker: &MemoryBroker, adapter: Arc<PersistenceAdapter>, policy: RedeliveryPolicy) -> Arc<DeliveryLoop> {
    Arc::new(
        DeliveryLoop::new(
            ChannelGateway::new(Arc::new(broker.clone())),
            ChannelBinding::new(CUSTOMERS, RecordKind::Customer),
            adapter,
            policy,
        )
        .with_receive_wait(Duration::from_millis(20)),
    )
}

// =============================================================================
// Store Failures
// =============================================================================

#[tokio::test]
async fn chaos_store_failures_on_specific_calls_are_redelivered() {
    let memory = MemoryBroker::new();
    publish_customers(&memory, 3).await;

    let store = Arc::new(FailingRecordStore::new(
        MemoryRecordStore::new(),
        vec![1, 2, 4],
        StoreError::Unavailable("connection reset".into()),
    ));
    let adapter = Arc::new(PersistenceAdapter::new(store.clone()));
    let delivery_loop = customer_loop(&memory, adapter, RedeliveryPolicy::default());

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn({
        let delivery_loop = delivery_loop.clone();
        async move { delivery_loop.subscribe(rx).await }
    });
    wait_for_customers(store.as_ref(), 3).await;
    wait_until("all acked", || delivery_loop.stats().acked() == 3).await;
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(delivery_loop.stats().failures(), 3);
    assert_eq!(delivery_loop.stats().requeued(), 3);
    assert_eq!(memory.ready_len(CUSTOMERS), 0);
    assert_eq!(memory.unacked_len(CUSTOMERS), 0);
}

#[tokio::test]
async fn chaos_circuit_opens_during_outage_and_recovers() {
    let memory = MemoryBroker::new();
    publish_customers(&memory, 5).await;

    let store = Arc::new(FailingRecordStore::down(MemoryRecordStore::new()));
    let adapter = Arc::new(PersistenceAdapter::with_circuit(store.clone(), CircuitConfig::fast()));
    let delivery_loop = customer_loop(&memory, adapter.clone(), RedeliveryPolicy::default());

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn({
        let delivery_loop = delivery_loop.clone();
        async move { delivery_loop.subscribe(rx).await }
    });

    wait_until("circuit rejecting", || adapter.circuit().rejections() > 0).await;
    // While open, calls stop reaching the store.
    let calls_while_open = store.calls();
    assert!(calls_while_open < adapter.circuit().calls_total());

    store.set_down(false);
    wait_for_customers(store.as_ref(), 5).await;
    wait_until("all acked", || delivery_loop.stats().acked() == 5).await;
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(memory.ready_len(CUSTOMERS) + memory.unacked_len(CUSTOMERS), 0);
}

#[tokio::test]
async fn chaos_conflict_is_dead_lettered_without_retries() {
    let memory = MemoryBroker::new();
    publish_customers(&memory, 2).await;

    let store = Arc::new(FailingRecordStore::new(
        MemoryRecordStore::new(),
        vec![1],
        StoreError::Conflict {
            kind: RecordKind::Customer,
            reason: "injected".into(),
        },
    ));
    let adapter = Arc::new(PersistenceAdapter::new(store.clone()));
    let policy = RedeliveryPolicy {
        requeue_on_failure: true,
        max_redeliveries: 0,
        dead_letter_channel: Some("dead".into()),
    };
    let delivery_loop = customer_loop(&memory, adapter, policy);

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn({
        let delivery_loop = delivery_loop.clone();
        async move { delivery_loop.subscribe(rx).await }
    });
    wait_until("settled", || {
        delivery_loop.stats().acked() + delivery_loop.stats().dead_lettered() == 2
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    // c0 hit the injected conflict on its first insert and found no
    // matching record under its email, so it went straight to "dead".
    assert_eq!(delivery_loop.stats().dead_lettered(), 1);
    assert_eq!(memory.ready_len("dead"), 1);
    let stored = store.list(RecordKind::Customer).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body["email"], "c1@x.com");
}

// =============================================================================
// Substrate Failures
// =============================================================================

#[tokio::test]
async fn chaos_publish_during_outage_fails_then_recovers() {
    let memory = MemoryBroker::new();
    let publisher = Publisher::new(ChannelGateway::new(Arc::new(memory.clone())));

    memory.set_available(false);
    let err = publisher
        .publish_json(CUSTOMERS, RecordKind::Customer, customer(0))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Connection(_)));
    assert_eq!(memory.ready_len(CUSTOMERS), 0);

    memory.set_available(true);
    publisher
        .publish_json(CUSTOMERS, RecordKind::Customer, customer(0))
        .await
        .unwrap();
    assert_eq!(memory.ready_len(CUSTOMERS), 1);
}

#[tokio::test]
async fn chaos_substrate_restarts_while_consuming() {
    let memory = MemoryBroker::new();
    let store = Arc::new(MemoryRecordStore::new());
    let config = IngestConfig {
        receive_wait_ms: 20,
        reconnect_initial_ms: 5,
        reconnect_max_ms: 50,
        ..Default::default()
    };
    let service = IngestService::start_with(Arc::new(memory.clone()), store.clone(), config).unwrap();

    for n in 0..10 {
        service.submit(RecordKind::Customer, customer(n)).await.unwrap();
        if n == 4 {
            memory.set_available(false);
            memory.restart();
            tokio::time::sleep(Duration::from_millis(30)).await;
            memory.set_available(true);
        }
    }

    wait_for_customers(store.as_ref(), 10).await;
    let customers = service.delivery_loop(RecordKind::Customer).unwrap();
    wait_until("listening again", || customers.state() == LoopState::Listening).await;
    wait_until("channel drained", || {
        memory.ready_len(CUSTOMERS) + memory.unacked_len(CUSTOMERS) == 0
    })
    .await;
    service.shutdown().await.unwrap();

    // Redelivery of a record stored just before the restart is absorbed.
    assert_eq!(store.len(), 10);
}

#[tokio::test]
async fn chaos_garbage_payloads_are_dead_lettered() {
    let memory = MemoryBroker::new();
    let session = memory.connect().await.unwrap();
    session.declare(CUSTOMERS, true).await.unwrap();
    let payloads: [&[u8]; 5] = [
        br#"{"name":"A","email":"a@x.com","phone":"1"}"#,
        b"\xff\xfe not utf-8",
        br#"["an","array"]"#,
        br#"{"name":"B","email":"b@x.com","phone":"2"}"#,
        br#"{"name":"C","email":"c@x.com","phone":3}"#,
    ];
    for payload in payloads {
        session.publish(CUSTOMERS, payload, true).await.unwrap();
    }
    session.close().await.unwrap();

    let store = Arc::new(MemoryRecordStore::new());
    let policy = RedeliveryPolicy {
        requeue_on_failure: true,
        max_redeliveries: 1,
        dead_letter_channel: Some("dead".into()),
    };
    let delivery_loop = customer_loop(&memory, Arc::new(PersistenceAdapter::new(store.clone())), policy);

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn({
        let delivery_loop = delivery_loop.clone();
        async move { Supervisor::default().run(&delivery_loop, rx).await }
    });
    wait_until("all settled", || {
        delivery_loop.stats().acked() == 2 && delivery_loop.stats().dead_lettered() == 3
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(memory.ready_len("dead"), 3);
    assert_eq!(memory.ready_len(CUSTOMERS), 0);
}
