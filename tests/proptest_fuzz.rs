//! Property-based tests (fuzzing) for the ingest path.
//!
//! Uses proptest to generate random/malformed payloads and publish
//! sequences, and verifies decoding never panics and the memory channel
//! never loses or reorders messages.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use queue_ingest::channel::memory::MemoryBroker;
use queue_ingest::{Broker, BrokerSession, IngestConfig, Record, RecordError, RecordKind, RedeliveryPolicy};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn kind_strategy() -> impl Strategy<Value = RecordKind> {
    prop_oneof![Just(RecordKind::Customer), Just(RecordKind::Order)]
}

/// Non-blank printable text
fn text_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9][A-Za-z0-9 ._@-]{0,30}"
}

fn valid_customer_strategy() -> impl Strategy<Value = Value> {
    (text_strategy(), "[a-z0-9]{1,10}@[a-z]{1,8}\\.com", "[0-9-]{3,12}", prop::option::of(text_strategy()))
        .prop_map(|(name, email, phone, address)| {
            let mut body = json!({"name": name, "email": email, "phone": phone});
            if let Some(address) = address {
                body["address"] = json!(address);
            }
            body
        })
}

fn valid_order_strategy() -> impl Strategy<Value = Value> {
    (
        "[a-f0-9]{8}",
        -1.0e6f64..1.0e6,
        prop::collection::vec((text_strategy(), 0i64..100, 0.0f64..500.0), 0..5),
    )
        .prop_map(|(customer_id, total, items)| {
            let items: Vec<Value> = items
                .into_iter()
                .map(|(item_name, quantity, price)| json!({"itemName": item_name, "quantity": quantity, "price": price}))
                .collect();
            json!({"customerId": customer_id, "totalAmount": total, "items": items})
        })
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
        prop_oneof![Just("name"), Just("email"), Just("customerId")].prop_map(|s| Value::String(s.into())),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(
                    prop_oneof![
                        Just("name".to_string()),
                        Just("email".to_string()),
                        Just("phone".to_string()),
                        Just("customerId".to_string()),
                        Just("totalAmount".to_string()),
                        Just("items".to_string()),
                        ".*",
                    ],
                    inner,
                    0..10
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Decode Fuzz Tests
// =============================================================================

proptest! {
    /// Decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_decode_random_bytes(kind in kind_strategy(), bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = Record::decode(kind, &bytes);
    }

    /// Arbitrary JSON either decodes into a valid record of the asked kind or fails cleanly
    #[test]
    fn fuzz_decode_arbitrary_json(kind in kind_strategy(), value in arbitrary_json_strategy()) {
        let bytes = serde_json::to_vec(&value).unwrap();
        match Record::decode(kind, &bytes) {
            Ok(record) => {
                prop_assert_eq!(record.kind(), kind);
                prop_assert!(record.validate().is_ok());
            }
            Err(RecordError::Malformed { kind: k, .. }) | Err(RecordError::Validation { kind: k, .. }) => {
                prop_assert_eq!(k, kind);
            }
        }
    }

    /// Truncated valid payloads never decode into a different record
    #[test]
    fn fuzz_truncated_customer(body in valid_customer_strategy(), cut in 0usize..200) {
        let bytes = serde_json::to_vec(&body).unwrap();
        let cut = cut.min(bytes.len().saturating_sub(1));
        let result = Record::decode(RecordKind::Customer, &bytes[..cut]);
        let is_malformed = matches!(result, Err(RecordError::Malformed { .. }));
        prop_assert!(is_malformed);
    }

    #[test]
    fn prop_valid_customer_decodes(body in valid_customer_strategy()) {
        let record = Record::decode(RecordKind::Customer, &serde_json::to_vec(&body).unwrap()).unwrap();
        prop_assert_eq!(record.unique_key(), body["email"].as_str());
        prop_assert_eq!(Value::Object(record.to_body()), body);
    }

    #[test]
    fn prop_valid_order_decodes(body in valid_order_strategy()) {
        let record = Record::decode(RecordKind::Order, &serde_json::to_vec(&body).unwrap()).unwrap();
        prop_assert_eq!(record.kind(), RecordKind::Order);
        prop_assert!(record.unique_key().is_none());
    }

    /// Blanking any required field is reported as a validation error on that field
    #[test]
    fn prop_blank_required_field_is_named(
        body in valid_customer_strategy(),
        field_idx in 0usize..3,
        blank in prop_oneof![Just(Value::Null), Just(json!("")), Just(json!("   "))],
        remove in any::<bool>(),
    ) {
        let field = RecordKind::Customer.required_fields()[field_idx];
        let mut body = body;
        if remove {
            body.as_object_mut().unwrap().remove(field);
        } else {
            body[field] = blank;
        }

        let err = Record::decode(RecordKind::Customer, &serde_json::to_vec(&body).unwrap()).unwrap_err();
        prop_assert_eq!(err, RecordError::Validation { kind: RecordKind::Customer, field });
    }
}

// =============================================================================
// Policy and Config Properties
// =============================================================================

proptest! {
    /// Once exhausted, a delivery stays exhausted on every later attempt
    #[test]
    fn prop_exhaustion_is_monotonic(max in 0u32..50, count in 0u32..100) {
        let policy = RedeliveryPolicy { max_redeliveries: max, ..Default::default() };
        if policy.is_exhausted(count) {
            prop_assert!(policy.is_exhausted(count + 1));
        }
        prop_assert!(policy.is_exhausted(max + 1));
        prop_assert!(!policy.is_exhausted(max));
    }

    /// Overlaying arbitrary environment values never panics
    #[test]
    fn fuzz_config_overlay(env in prop::collection::hash_map(
        prop_oneof![
            Just("CHANNEL_URL".to_string()),
            Just("STORE_URL".to_string()),
            Just("CUSTOMER_QUEUE".to_string()),
            Just("ORDER_QUEUE".to_string()),
            Just("DEAD_LETTER_QUEUE".to_string()),
            Just("MAX_REDELIVERIES".to_string()),
        ],
        ".{0,20}",
        0..6,
    )) {
        let lookup = |var: &str| env.get(var).cloned();
        if let Ok(config) = IngestConfig::default().overlay(lookup) {
            let _ = config.validate();
            if let Some(value) = env.get("MAX_REDELIVERIES") {
                prop_assert_eq!(Some(config.max_redeliveries), value.trim().parse().ok());
            }
        }
    }
}

// =============================================================================
// Channel Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A single consumer receives messages in publish order
    #[test]
    fn prop_memory_channel_is_fifo(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..40)) {
        let received = runtime().block_on(async {
            let broker = MemoryBroker::new();
            let session = broker.connect().await.unwrap();
            session.declare("fifo", true).await.unwrap();
            for payload in &payloads {
                session.publish("fifo", payload, true).await.unwrap();
            }

            let mut received = Vec::new();
            while let Some(delivery) = session.receive("fifo", Duration::ZERO).await.unwrap() {
                session.ack(&delivery.tag).await.unwrap();
                received.push(delivery.payload);
            }
            received
        });
        prop_assert_eq!(received, payloads);
    }

    /// Arbitrary ack/requeue decisions never lose a message: everything
    /// published is eventually acked exactly once.
    #[test]
    fn prop_requeue_never_loses_messages(
        count in 1usize..30,
        decisions in prop::collection::vec(any::<bool>(), 0..120),
    ) {
        let (acked, published) = runtime().block_on(async {
            let broker = MemoryBroker::new();
            let session = broker.connect().await.unwrap();
            session.declare("work", true).await.unwrap();
            let published: Vec<Vec<u8>> = (0..count).map(|n| n.to_string().into_bytes()).collect();
            for payload in &published {
                session.publish("work", payload, true).await.unwrap();
            }

            let mut decisions = decisions.into_iter();
            let mut acked: HashMap<Vec<u8>, u32> = HashMap::new();
            while let Some(delivery) = session.receive("work", Duration::ZERO).await.unwrap() {
                // Requeue while the script says so, then ack everything left.
                if decisions.next().unwrap_or(true) {
                    session.ack(&delivery.tag).await.unwrap();
                    *acked.entry(delivery.payload).or_default() += 1;
                } else {
                    session.requeue(&delivery.tag).await.unwrap();
                }
            }
            (acked, published)
        });

        prop_assert_eq!(acked.len(), published.len());
        prop_assert!(acked.values().all(|&n| n == 1));
        for payload in published {
            prop_assert!(acked.contains_key(&payload));
        }
    }
}
