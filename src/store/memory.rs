use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::{merge_patch, new_record_id, unique_key_of, RecordId, RecordStore, StoreError, StoredRecord};
use crate::channel::traits::now_millis;
use crate::record::RecordKind;

/// In-process record store.
pub struct MemoryRecordStore {
    records: DashMap<RecordId, (u64, StoredRecord)>,
    unique: DashMap<(RecordKind, String), RecordId>,
    seq: AtomicU64,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            unique: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get(&self, kind: RecordKind, id: &str) -> Option<StoredRecord> {
        self.records
            .get(id)
            .map(|r| r.value().1.clone())
            .filter(|r| r.kind == kind)
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, kind: RecordKind, body: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        let id = new_record_id();
        if let Some(key) = unique_key_of(kind, body) {
            match self.unique.entry((kind, key.to_string())) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict {
                        kind,
                        reason: format!("duplicate {} '{}'", kind.unique_field().unwrap_or("key"), key),
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(id.clone());
                }
            }
        }

        let record = StoredRecord {
            id: id.clone(),
            kind,
            body: body.clone(),
            created_at: now_millis(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.records.insert(id, (seq, record.clone()));
        Ok(record)
    }

    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        Ok(self.get(kind, id))
    }

    async fn find_by_unique_key(&self, kind: RecordKind, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let id = self.unique.get(&(kind, key.to_string())).map(|r| r.value().clone());
        Ok(id.and_then(|id| self.get(kind, &id)))
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError> {
        let mut found: Vec<(u64, StoredRecord)> = self
            .records
            .iter()
            .filter(|r| r.value().1.kind == kind)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, r)| r).collect())
    }

    async fn update(&self, kind: RecordKind, id: &str, patch: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        let Some(current) = self.get(kind, id) else {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        };

        let mut body = current.body.clone();
        merge_patch(&mut body, patch);

        let old_key = current.unique_key().map(str::to_string);
        let new_key = unique_key_of(kind, &body).map(str::to_string);
        if new_key != old_key {
            if let Some(key) = &new_key {
                match self.unique.entry((kind, key.clone())) {
                    Entry::Occupied(_) => {
                        return Err(StoreError::Conflict {
                            kind,
                            reason: format!("duplicate {} '{}'", kind.unique_field().unwrap_or("key"), key),
                        })
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(id.to_string());
                    }
                }
            }
            if let Some(key) = old_key {
                self.unique.remove(&(kind, key));
            }
        }

        let updated = StoredRecord { body, ..current };
        match self.records.get_mut(id) {
            Some(mut entry) => {
                entry.value_mut().1 = updated.clone();
                Ok(updated)
            }
            // Deleted concurrently.
            None => Err(StoreError::NotFound { kind, id: id.to_string() }),
        }
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        if self.get(kind, id).is_none() {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        }
        if let Some((_, (_, record))) = self.records.remove(id) {
            if let Some(key) = record.unique_key() {
                self.unique.remove(&(kind, key.to_string()));
            }
        }
        Ok(())
    }
}
