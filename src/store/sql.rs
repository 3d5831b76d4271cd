// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL record store (SQLite or MySQL through the sqlx `Any` driver).
//!
//! ```sql
//! CREATE TABLE records (
//!   seq BIGINT AUTO_INCREMENT PRIMARY KEY, -- insertion order
//!   id VARCHAR(24) NOT NULL UNIQUE,
//!   kind VARCHAR(16) NOT NULL,
//!   unique_key VARCHAR(255),               -- customer email, NULL for orders
//!   body LONGTEXT NOT NULL,                -- JSON object as text
//!   created_at BIGINT NOT NULL,
//!   UNIQUE (kind, unique_key)
//! )
//! ```
//!
//! Body is stored as TEXT rather than a native JSON column because the `Any`
//! driver has no JSON type mapping; MySQL returns it as bytes.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use super::traits::{merge_patch, new_record_id, unique_key_of, RecordStore, StoreError, StoredRecord};
use crate::channel::traits::now_millis;
use crate::record::RecordKind;
use crate::resilience::retry::{retry, RetryConfig};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn map_sqlx(kind: RecordKind, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict {
                kind,
                reason: db.message().to_string(),
            };
        }
    }
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

/// Read a TEXT column: String on SQLite, bytes on MySQL.
fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

const COLUMNS: &str = "id, kind, body, created_at";

/// Upper bound on one startup connect attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SqlRecordStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRecordStore {
    /// Connect with startup-mode retry and create the table if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_store_connect", &RetryConfig::startup(), || async {
            let connect = AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string);
            match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, connect).await {
                Ok(pool) => pool.map_err(|e| StoreError::Unavailable(e.to_string())),
                Err(_) => Err(StoreError::Unavailable(format!(
                    "no connection within {:?}",
                    CONNECT_ATTEMPT_TIMEOUT
                ))),
            }
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&store.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        }
        store.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL record store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                unique_key TEXT,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (kind, unique_key)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                id VARCHAR(24) NOT NULL UNIQUE,
                kind VARCHAR(16) NOT NULL,
                unique_key VARCHAR(255),
                body LONGTEXT NOT NULL,
                created_at BIGINT NOT NULL,
                UNIQUE KEY uq_kind_key (kind, unique_key),
                INDEX idx_kind (kind)
            )
            "#
        };

        retry("sql_store_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;
        Ok(())
    }

    fn parse_row(kind: RecordKind, row: &AnyRow) -> Result<StoredRecord, StoreError> {
        let id = text_column(row, "id").ok_or_else(|| StoreError::Backend("row without id".into()))?;
        let body_text = text_column(row, "body").ok_or_else(|| StoreError::Backend(format!("row {} without body", id)))?;
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(StoreError::Backend(format!("row {} body is not an object", id))),
            Err(e) => return Err(StoreError::Backend(format!("row {} body: {}", id, e))),
        };
        let created_at: i64 = row.try_get("created_at").unwrap_or(0);
        Ok(StoredRecord {
            id,
            kind,
            body,
            created_at,
        })
    }

    async fn fetch_one_by(&self, kind: RecordKind, column: &str, value: &str) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!("SELECT {} FROM records WHERE kind = ? AND {} = ?", COLUMNS, column);
        retry("sql_store_find", &RetryConfig::query(), || async {
            let row = sqlx::query(&sql)
                .bind(kind.as_str())
                .bind(value)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx(kind, e))?;
            row.map(|r| Self::parse_row(kind, &r)).transpose()
        })
        .await
    }

    fn encode_body(kind: RecordKind, body: &Map<String, Value>) -> Result<String, StoreError> {
        serde_json::to_string(body).map_err(|e| StoreError::Backend(format!("{} body: {}", kind, e)))
    }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    fn name(&self) -> &'static str {
        if self.is_sqlite {
            "sqlite"
        } else {
            "mysql"
        }
    }

    async fn insert(&self, kind: RecordKind, body: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        let record = StoredRecord {
            id: new_record_id(),
            kind,
            body: body.clone(),
            created_at: now_millis(),
        };
        let text = Self::encode_body(kind, body)?;

        // Not retried here: a conflict would repeat, and redelivery retries transient failures.
        sqlx::query("INSERT INTO records (id, kind, unique_key, body, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&record.id)
            .bind(kind.as_str())
            .bind(unique_key_of(kind, body))
            .bind(&text)
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(kind, e))?;
        Ok(record)
    }

    async fn find_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.fetch_one_by(kind, "id", id).await
    }

    async fn find_by_unique_key(&self, kind: RecordKind, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        if kind.unique_field().is_none() {
            return Ok(None);
        }
        self.fetch_one_by(kind, "unique_key", key).await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!("SELECT {} FROM records WHERE kind = ? ORDER BY seq", COLUMNS);
        retry("sql_store_list", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql)
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx(kind, e))?;
            rows.iter()
                .map(|r| Self::parse_row(kind, r))
                .collect::<Result<Vec<_>, StoreError>>()
        })
        .await
    }

    async fn update(&self, kind: RecordKind, id: &str, patch: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        let Some(current) = self.find_by_id(kind, id).await? else {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        };
        let mut body = current.body.clone();
        merge_patch(&mut body, patch);
        let text = Self::encode_body(kind, &body)?;

        let result = sqlx::query("UPDATE records SET body = ?, unique_key = ? WHERE kind = ? AND id = ?")
            .bind(&text)
            .bind(unique_key_of(kind, &body))
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(kind, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        }
        Ok(StoredRecord { body, ..current })
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(kind, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind, id: id.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqlRecordStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("records.db").display());
        SqlRecordStore::new(&url).await.unwrap()
    }

    fn body(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_find_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let b = body(json!({"name": "Alice", "email": "a@x.com", "phone": "555-0100"}));

        let stored = store.insert(RecordKind::Customer, &b).await.unwrap();
        assert_eq!(stored.id.len(), 24);

        let found = store.find_by_id(RecordKind::Customer, &stored.id).await.unwrap().unwrap();
        assert_eq!(found.body, b);
        assert_eq!(found.created_at, stored.created_at);
    }

    #[tokio::test]
    async fn test_unique_violation_is_conflict() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let b = body(json!({"name": "Alice", "email": "a@x.com", "phone": "1"}));

        store.insert(RecordKind::Customer, &b).await.unwrap();
        let err = store.insert(RecordKind::Customer, &b).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "got {:?}", err);

        let existing = store.find_by_unique_key(RecordKind::Customer, "a@x.com").await.unwrap();
        assert!(existing.is_some());
    }

    #[tokio::test]
    async fn test_orders_allow_duplicates_and_list_in_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        for i in 0..3 {
            let b = body(json!({"customerId": "c1", "totalAmount": i}));
            store.insert(RecordKind::Order, &b).await.unwrap();
        }
        let all = store.list(RecordKind::Order).await.unwrap();
        let totals: Vec<i64> = all.iter().map(|r| r.body["totalAmount"].as_i64().unwrap()).collect();
        assert_eq!(totals, vec![0, 1, 2]);
        assert!(store.list(RecordKind::Customer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let b = body(json!({"name": "Alice", "email": "a@x.com", "phone": "1"}));
        let stored = store.insert(RecordKind::Customer, &b).await.unwrap();

        let updated = store
            .update(RecordKind::Customer, &stored.id, &body(json!({"phone": "2"})))
            .await
            .unwrap();
        assert_eq!(updated.body["phone"], "2");
        assert_eq!(updated.body["name"], "Alice");

        store.delete(RecordKind::Customer, &stored.id).await.unwrap();
        assert!(matches!(
            store.delete(RecordKind::Customer, &stored.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.find_by_id(RecordKind::Customer, &stored.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = store(&dir).await;
            let b = body(json!({"customerId": "c1", "totalAmount": 5.5}));
            store.insert(RecordKind::Order, &b).await.unwrap().id
        };
        let store = store(&dir).await;
        assert!(store.find_by_id(RecordKind::Order, &id).await.unwrap().is_some());
    }
}
