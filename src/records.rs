//! Read-side CRUD over the shared record store.
//!
//! Plain pass-through: nothing here touches a channel. Orders can be read
//! with their customer resolved in place of `customerId`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::record::RecordKind;
use crate::store::{RecordStore, StoreError, StoredRecord};

/// An order plus the customer its `customerId` points at, if that customer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderWithCustomer {
    pub order: StoredRecord,
    pub customer: Option<StoredRecord>,
}

impl OrderWithCustomer {
    /// The order document with `customerId` replaced by the customer document
    /// (`null` when the reference dangles).
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut doc = self.order.to_document();
        if let Value::Object(map) = &mut doc {
            let customer = self
                .customer
                .as_ref()
                .map_or(Value::Null, StoredRecord::to_document);
            map.insert("customerId".to_string(), customer);
        }
        doc
    }
}

#[derive(Clone)]
pub struct Records {
    store: Arc<dyn RecordStore>,
}

impl Records {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError> {
        self.store.list(kind).await
    }

    pub async fn get(&self, kind: RecordKind, id: &str) -> Result<StoredRecord, StoreError> {
        self.store
            .find_by_id(kind, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    /// Shallow-merge `patch` into the record and return the updated record.
    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, kind: RecordKind, id: &str, patch: &Map<String, Value>) -> Result<StoredRecord, StoreError> {
        let updated = self.store.update(kind, id, patch).await?;
        debug!(fields = patch.len(), "Record updated");
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        self.store.delete(kind, id).await?;
        debug!("Record deleted");
        Ok(())
    }

    pub async fn get_order_with_customer(&self, id: &str) -> Result<OrderWithCustomer, StoreError> {
        let order = self.get(RecordKind::Order, id).await?;
        let customer = match customer_ref(&order) {
            Some(customer_id) => self.store.find_by_id(RecordKind::Customer, customer_id).await?,
            None => None,
        };
        Ok(OrderWithCustomer { order, customer })
    }

    pub async fn list_orders_with_customers(&self) -> Result<Vec<OrderWithCustomer>, StoreError> {
        let orders = self.store.list(RecordKind::Order).await?;
        let mut customers: HashMap<String, Option<StoredRecord>> = HashMap::new();
        let mut populated = Vec::with_capacity(orders.len());

        for order in orders {
            let customer = match customer_ref(&order) {
                Some(customer_id) => {
                    if !customers.contains_key(customer_id) {
                        let found = self.store.find_by_id(RecordKind::Customer, customer_id).await?;
                        customers.insert(customer_id.to_string(), found);
                    }
                    customers.get(customer_id).cloned().flatten()
                }
                None => None,
            };
            populated.push(OrderWithCustomer { order, customer });
        }
        Ok(populated)
    }
}

fn customer_ref(order: &StoredRecord) -> Option<&str> {
    order.body.get("customerId").and_then(Value::as_str)
}
