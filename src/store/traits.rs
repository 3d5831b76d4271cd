use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::RecordKind;

/// Store-assigned record identity: 24 lowercase hex characters.
pub type RecordId = String;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: RecordId },
    /// Uniqueness (or reference) constraint rejected the write.
    #[error("{kind} conflict: {reason}")]
    Conflict { kind: RecordKind, reason: String },
    /// The store could not be reached. Transient.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub body: Map<String, Value>,
    /// Unix millis at insert.
    pub created_at: i64,
}

impl StoredRecord {
    /// The body with the identity under `_id`, the shape read-side callers expect.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut doc = Map::with_capacity(self.body.len() + 1);
        doc.insert("_id".to_string(), Value::String(self.id.clone()));
        for (k, v) in &self.body {
            doc.insert(k.clone(), v.clone());
        }
        Value::Object(doc)
    }

    /// Value of the kind's unique attribute in the stored body.
    #[must_use]
    pub fn unique_key(&self) -> Option<&str> {
        unique_key_of(self.kind, &self.body)
    }
}

/// Keyed store capability shared by the delivery loops and the read side.
///
/// Implementations enforce uniqueness of [`RecordKind::unique_field`] per
/// kind and report violations as [`StoreError::Conflict`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create a record, assigning it a new identity.
    async fn insert(&self, kind: RecordKind, body: &Map<String, Value>) -> Result<StoredRecord, StoreError>;

    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Find by the kind's unique attribute. Always `None` for kinds without one.
    async fn find_by_unique_key(&self, kind: RecordKind, key: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// All records of `kind` in insertion order.
    async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError>;

    /// Shallow-merge `patch` into the stored body.
    async fn update(&self, kind: RecordKind, id: &str, patch: &Map<String, Value>) -> Result<StoredRecord, StoreError>;

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError>;
}

#[must_use]
pub fn new_record_id() -> RecordId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

pub(crate) fn unique_key_of(kind: RecordKind, body: &Map<String, Value>) -> Option<&str> {
    kind.unique_field()
        .and_then(|field| body.get(field))
        .and_then(Value::as_str)
}

pub(crate) fn merge_patch(body: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (k, v) in patch {
        // Identity is not patchable.
        if k == "_id" {
            continue;
        }
        body.insert(k.clone(), v.clone());
    }
}
