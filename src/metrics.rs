// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for queue-ingest.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `queue_ingest_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `channel`: logical channel name
//! - `outcome`: acked, requeued, dead_lettered, unacked, poison
//! - `kind`: validation, conflict, store_unavailable, malformed
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a publish attempt
pub fn record_publish(channel: &str, status: &str) {
    counter!(
        "queue_ingest_publish_total",
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how a delivery was settled
pub fn record_delivery(channel: &str, outcome: &str) {
    counter!(
        "queue_ingest_deliveries_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a delivery that had been delivered before
pub fn record_redelivery(channel: &str) {
    counter!(
        "queue_ingest_redeliveries_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a handler failure by kind
pub fn record_handler_failure(channel: &str, kind: &str) {
    counter!(
        "queue_ingest_handler_failures_total",
        "channel" => channel.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record handler latency
pub fn record_handler_latency(channel: &str, duration: Duration) {
    histogram!(
        "queue_ingest_handler_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a store operation
pub fn record_store_operation(operation: &str, status: &str) {
    counter!(
        "queue_ingest_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record store latency
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!(
        "queue_ingest_store_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "queue_ingest_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed attempt to reach the channel substrate
pub fn record_connection_error(backend: &str) {
    counter!(
        "queue_ingest_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record a consumer reconnect
pub fn record_reconnect(channel: &str) {
    counter!(
        "queue_ingest_reconnects_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Set the delivery loop state for a channel (one-hot gauge)
pub fn set_loop_state(channel: &str, state: &str) {
    for s in ["idle", "connecting", "declaring", "listening", "stopping", "stopped", "failed"] {
        gauge!(
            "queue_ingest_loop_state",
            "channel" => channel.to_string(),
            "state" => s
        )
        .set(if s == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records store latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_store_latency(self.operation, self.start.elapsed());
    }
}
