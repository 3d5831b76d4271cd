//! Business records carried through the queue.
//!
//! A [`Record`] is a tagged union of the known record kinds. The wire format
//! on a channel is the record's body as a UTF-8 JSON object with camelCase
//! field names and no envelope: the kind is implied by the channel the
//! payload travels on (see [`crate::consumer::ChannelBinding`]).
//!
//! # Example
//!
//! ```
//! use queue_ingest::{Record, RecordKind};
//!
//! let bytes = br#"{"name":"Alice","email":"a@x.com","phone":"555-0100"}"#;
//! let record = Record::decode(RecordKind::Customer, bytes).unwrap();
//!
//! assert_eq!(record.kind(), RecordKind::Customer);
//! assert_eq!(record.unique_key(), Some("a@x.com"));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while decoding or validating a record body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Payload is not a UTF-8 JSON object, or a field has the wrong type.
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: RecordKind, reason: String },
    /// A required attribute is absent, null, or blank.
    #[error("{kind} is missing required field '{field}'")]
    Validation { kind: RecordKind, field: &'static str },
}

/// Schema tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Customer,
    Order,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Customer, RecordKind::Order];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Order => "Order",
        }
    }

    /// Attributes that must be present and non-blank at persistence time.
    #[must_use]
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Customer => &["name", "email", "phone"],
            Self::Order => &["customerId", "totalAmount"],
        }
    }

    /// Attribute the store keeps unique across records of this kind.
    #[must_use]
    pub fn unique_field(&self) -> Option<&'static str> {
        match self {
            Self::Customer => Some("email"),
            Self::Order => None,
        }
    }

    /// Conventional channel name for this kind.
    #[must_use]
    pub fn default_channel(&self) -> &'static str {
        match self {
            Self::Customer => "customer_queue",
            Self::Order => "order_queue",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Identity of the customer this order belongs to.
    pub customer_id: String,
    /// RFC 3339 timestamp supplied by the caller, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_date: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
}

/// A record of one of the known kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Customer(Customer),
    Order(Order),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Customer(_) => RecordKind::Customer,
            Self::Order(_) => RecordKind::Order,
        }
    }

    /// Decode a channel payload as a record of `kind`.
    pub fn decode(kind: RecordKind, bytes: &[u8]) -> Result<Self, RecordError> {
        let text = std::str::from_utf8(bytes).map_err(|e| RecordError::Malformed {
            kind,
            reason: format!("invalid UTF-8: {}", e),
        })?;
        let value: Value = serde_json::from_str(text).map_err(|e| RecordError::Malformed {
            kind,
            reason: e.to_string(),
        })?;
        Self::from_value(kind, value)
    }

    /// Build a record of `kind` from an already-parsed JSON value.
    ///
    /// Required fields are checked before the typed conversion so a missing
    /// attribute surfaces as [`RecordError::Validation`], not as a parse error.
    pub fn from_value(kind: RecordKind, value: Value) -> Result<Self, RecordError> {
        let Value::Object(map) = value else {
            return Err(RecordError::Malformed {
                kind,
                reason: "payload is not a JSON object".into(),
            });
        };
        check_required(kind, &map)?;

        let malformed = |e: serde_json::Error| RecordError::Malformed {
            kind,
            reason: e.to_string(),
        };
        let record = match kind {
            RecordKind::Customer => {
                Self::Customer(serde_json::from_value(Value::Object(map)).map_err(malformed)?)
            }
            RecordKind::Order => {
                Self::Order(serde_json::from_value(Value::Object(map)).map_err(malformed)?)
            }
        };
        record.validate()?;
        Ok(record)
    }

    /// Check that every required attribute is non-blank.
    pub fn validate(&self) -> Result<(), RecordError> {
        let blank = |s: &str| s.trim().is_empty();
        match self {
            Self::Customer(c) => {
                let kind = RecordKind::Customer;
                if blank(&c.name) {
                    return Err(RecordError::Validation { kind, field: "name" });
                }
                if blank(&c.email) {
                    return Err(RecordError::Validation { kind, field: "email" });
                }
                if blank(&c.phone) {
                    return Err(RecordError::Validation { kind, field: "phone" });
                }
            }
            Self::Order(o) => {
                let kind = RecordKind::Order;
                if blank(&o.customer_id) {
                    return Err(RecordError::Validation { kind, field: "customerId" });
                }
                if !o.total_amount.is_finite() {
                    return Err(RecordError::Validation { kind, field: "totalAmount" });
                }
            }
        }
        Ok(())
    }

    /// The record body as a JSON object.
    #[must_use]
    pub fn to_body(&self) -> Map<String, Value> {
        let value = match self {
            Self::Customer(c) => serde_json::to_value(c),
            Self::Order(o) => serde_json::to_value(o),
        };
        match value {
            Ok(Value::Object(map)) => map,
            // Both variants are plain structs of strings and numbers.
            _ => Map::new(),
        }
    }

    /// Encode the body for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let kind = self.kind();
        let bytes = match self {
            Self::Customer(c) => serde_json::to_vec(c),
            Self::Order(o) => serde_json::to_vec(o),
        };
        bytes.map_err(|e| RecordError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }

    /// Value of the kind's unique attribute, if the kind has one.
    #[must_use]
    pub fn unique_key(&self) -> Option<&str> {
        match self {
            Self::Customer(c) => Some(c.email.as_str()),
            Self::Order(_) => None,
        }
    }
}

fn check_required(kind: RecordKind, map: &Map<String, Value>) -> Result<(), RecordError> {
    for &field in kind.required_fields() {
        let present = match map.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(RecordError::Validation { kind, field });
        }
    }
    Ok(())
}
