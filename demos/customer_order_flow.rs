// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Customer and order flow through the queue.
//!
//! Demonstrates:
//! 1. Starting the ingest service (one supervised loop per channel)
//! 2. Enqueueing customers and orders, acknowledged before persistence
//! 3. Waiting for the delivery loops to persist them
//! 4. Reading orders back with their customer populated
//! 5. A poison order ending up on the dead-letter channel
//! 6. Displaying metrics and shutting down
//!
//! Runs against the in-memory substrate and store by default. Point it at
//! real backends with environment variables:
//!
//! ```bash
//! CHANNEL_URL=redis://localhost:6379 \
//! STORE_URL=sqlite://records.db?mode=rwc \
//! cargo run --example customer_order_flow
//! ```

use std::time::{Duration, Instant};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use queue_ingest::{IngestConfig, IngestService, RecordKind};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          queue-ingest: Customer / Order Flow                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    let config = IngestConfig {
        dead_letter_channel: Some("ingest_dead_letter".into()),
        max_redeliveries: 2,
        receive_wait_ms: 100,
        ..IngestConfig::default()
    }
    .overlay(|var| std::env::var(var).ok())?;

    println!("📦 Channel substrate: {}", config.channel_url);
    println!("   Record store:      {}", config.store_url.as_deref().unwrap_or("memory"));

    let service = IngestService::start(config).await?;
    println!("   ✅ Service started");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Enqueue customers
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Enqueueing customers...");
    let customers = [
        json!({"name": "Alice", "email": "alice@example.com", "phone": "555-0100", "address": "1 Main St"}),
        json!({"name": "Bob", "email": "bob@example.com", "phone": "555-0101"}),
        json!({"name": "Carol", "email": "carol@example.com", "phone": "555-0102"}),
    ];
    for body in &customers {
        let start = Instant::now();
        let ack = service.submit(RecordKind::Customer, body.clone()).await?;
        println!("   └─ {} → {} ({} bytes, {:?})", body["email"], ack.channel, ack.bytes, start.elapsed());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Wait for persistence
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Waiting for the customer loop to persist...");
    let records = service.records().clone();
    let stored = loop {
        let stored = records.list(RecordKind::Customer).await?;
        if stored.len() >= customers.len() {
            break stored;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    for customer in &stored {
        println!("   └─ {} = {}", customer.id, customer.to_document());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Orders, read back with the customer populated
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛒 Enqueueing orders...");
    for (customer, total) in stored.iter().zip([19.99, 5.25, 120.0]) {
        service
            .submit(
                RecordKind::Order,
                json!({
                    "customerId": customer.id,
                    "orderDate": "2026-01-15T10:00:00Z",
                    "items": [{"itemName": "widget", "quantity": 1, "price": total}],
                    "totalAmount": total,
                }),
            )
            .await?;
    }

    // 5. An order for a customer that does not exist is retried, then dead-lettered.
    service
        .submit(RecordKind::Order, json!({"customerId": "no-such-customer", "totalAmount": 1.0}))
        .await?;

    let orders = loop {
        let orders = records.list_orders_with_customers().await?;
        if orders.len() >= stored.len() {
            break orders;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    println!("\n📖 Orders with customers:");
    for order in &orders {
        println!("   └─ {}", order.to_document());
    }

    if let Some(order_loop) = service.delivery_loop(RecordKind::Order) {
        let stats = order_loop.stats();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.dead_lettered() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        println!("\n☠️  Order loop: received={} acked={} requeued={} dead_lettered={}",
            stats.received(), stats.acked(), stats.requeued(), stats.dead_lettered());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    service.shutdown().await?;
    println!("   ✅ Shutdown complete");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{{{}}} = {}", key.name(), labels.join(","), value)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
