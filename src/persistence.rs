//! Persistence adapter: maps a decoded record to a store write.
//!
//! The delivery loop only sees [`RecordHandler`]; store internals stay here.
//! Failures are classified by [`FailureKind`] so they can be logged, counted,
//! and (if a caller wants) handled differently.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{self, LatencyTimer};
use crate::record::{Record, RecordError, RecordKind};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::store::{RecordStore, StoreError, StoredRecord};

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Payload could not be decoded as the channel's record kind.
    Malformed,
    /// A required attribute is missing or blank.
    Validation,
    /// The store rejected the write (uniqueness or reference constraint).
    Conflict,
    /// The store could not be reached. Expected to succeed on redelivery.
    StoreUnavailable,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("malformed record: {0}")]
    Malformed(RecordError),
    #[error("validation failed: {0}")]
    Validation(RecordError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl PersistError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Malformed(_) => FailureKind::Malformed,
            Self::Validation(_) => FailureKind::Validation,
            Self::Conflict(_) => FailureKind::Conflict,
            Self::StoreUnavailable(_) => FailureKind::StoreUnavailable,
        }
    }
}

impl From<RecordError> for PersistError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Malformed { .. } => Self::Malformed(e),
            RecordError::Validation { .. } => Self::Validation(e),
        }
    }
}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } => Self::Conflict(e.to_string()),
            StoreError::NotFound { .. } => Self::Conflict(e.to_string()),
            StoreError::Unavailable(_) | StoreError::Backend(_) => Self::StoreUnavailable(e.to_string()),
        }
    }
}

/// Per-record handler invoked by the delivery loop. `Ok` means the record is
/// durably handled and the delivery may be acknowledged.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: Record) -> Result<(), PersistError>;
}

/// Writes records to a [`RecordStore`] behind a circuit breaker.
pub struct PersistenceAdapter {
    store: Arc<dyn RecordStore>,
    circuit: CircuitBreaker,
    check_order_references: bool,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_circuit(store, CircuitConfig::default())
    }

    pub fn with_circuit(store: Arc<dyn RecordStore>, config: CircuitConfig) -> Self {
        let circuit = CircuitBreaker::new(format!("store_{}", store.name()), config);
        Self {
            store,
            circuit,
            check_order_references: true,
        }
    }

    /// Toggle the best-effort check that an order's `customerId` exists.
    #[must_use]
    pub fn check_order_references(mut self, enabled: bool) -> Self {
        self.check_order_references = enabled;
        self
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Run a store call through the circuit breaker. Conflicts and missing
    /// records are answers, not backend failures, so they do not count
    /// against the circuit.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let _timer = LatencyTimer::new(operation);
        let outcome = self
            .circuit
            .call(|| async {
                match f().await {
                    Ok(v) => Ok(Ok(v)),
                    Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound { .. })) => Ok(Err(e)),
                    Err(e) => Err(e),
                }
            })
            .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(CircuitError::Rejected) => Err(StoreError::Unavailable("circuit breaker open".into())),
            Err(CircuitError::Inner(e)) => Err(e),
        };
        let status = match &result {
            Ok(_) => "success",
            Err(StoreError::Conflict { .. }) => "conflict",
            Err(StoreError::NotFound { .. }) => "not_found",
            Err(_) => "error",
        };
        metrics::record_store_operation(operation, status);
        result
    }

    /// Validate and store `record`.
    ///
    /// A customer whose email already exists with an identical body is an
    /// at-least-once replay and resolves to the existing stored record.
    #[tracing::instrument(skip(self, record), fields(kind = %record.kind()))]
    pub async fn persist(&self, record: &Record) -> Result<StoredRecord, PersistError> {
        record.validate()?;

        if let Record::Order(order) = record {
            if self.check_order_references {
                let customer = self
                    .guarded("find_by_id", || self.store.find_by_id(RecordKind::Customer, &order.customer_id))
                    .await?;
                if customer.is_none() {
                    return Err(PersistError::Conflict(format!(
                        "order references unknown customer '{}'",
                        order.customer_id
                    )));
                }
            }
        }

        let kind = record.kind();
        let body = record.to_body();
        match self.guarded("insert", || self.store.insert(kind, &body)).await {
            Ok(stored) => {
                debug!(id = %stored.id, "Record stored");
                Ok(stored)
            }
            Err(conflict @ StoreError::Conflict { .. }) => {
                let Some(key) = record.unique_key() else {
                    return Err(conflict.into());
                };
                let existing = self
                    .guarded("find_by_unique_key", || self.store.find_by_unique_key(kind, key))
                    .await?;
                match existing {
                    Some(existing) if existing.body == body => {
                        debug!(id = %existing.id, "Duplicate delivery of an already stored record");
                        Ok(existing)
                    }
                    _ => {
                        warn!(key, "Unique key already taken by a different record");
                        Err(conflict.into())
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecordHandler for PersistenceAdapter {
    async fn handle(&self, record: Record) -> Result<(), PersistError> {
        self.persist(&record).await.map(|_| ())
    }
}
