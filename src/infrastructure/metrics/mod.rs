//! Prometheus Metrics Module
//!
//! Provides application-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - Active rooms and WebSocket connections on this process
//! - Fan-out deliveries and backpressure drops
//! - Broker publish and serialization failures
//! - Agent allocation outcomes

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Rooms with a running broadcast loop on this process
pub static ROOMS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("rooms_active", "Number of rooms running on this process")
            .namespace("support_chat"),
    )
    .expect("Failed to create ROOMS_ACTIVE metric")
});

/// Active WebSocket connections gauge
pub static WEBSOCKET_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new(
            "websocket_connections_active",
            "Number of active WebSocket connections",
        )
        .namespace("support_chat"),
    )
    .expect("Failed to create WEBSOCKET_CONNECTIONS_ACTIVE metric")
});

/// Payloads handed to client queues by the fan-out loop
pub static FANOUT_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "fanout_delivered_total",
            "Messages enqueued onto client outbound queues",
        )
        .namespace("support_chat"),
    )
    .expect("Failed to create FANOUT_DELIVERED_TOTAL metric")
});

/// Payloads dropped because a client queue was full
pub static FANOUT_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "fanout_dropped_total",
            "Messages dropped because a client outbound queue was full",
        )
        .namespace("support_chat"),
    )
    .expect("Failed to create FANOUT_DROPPED_TOTAL metric")
});

/// Outbound messages that never reached the broker
pub static PUBLISH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "publish_failures_total",
            "Room messages that could not be published",
        )
        .namespace("support_chat"),
        &["reason"], // "serialization", "broker"
    )
    .expect("Failed to create PUBLISH_FAILURES_TOTAL metric")
});

/// Agent allocation attempts by outcome
pub static ALLOCATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("allocations_total", "Agent allocation attempts").namespace("support_chat"),
        &["outcome"], // "allocated", "no_agent", "conflict", "error"
    )
    .expect("Failed to create ALLOCATIONS_TOTAL metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(ROOMS_ACTIVE.clone()))
        .expect("Failed to register ROOMS_ACTIVE");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register WEBSOCKET_CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(FANOUT_DELIVERED_TOTAL.clone()))
        .expect("Failed to register FANOUT_DELIVERED_TOTAL");
    registry
        .register(Box::new(FANOUT_DROPPED_TOTAL.clone()))
        .expect("Failed to register FANOUT_DROPPED_TOTAL");
    registry
        .register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))
        .expect("Failed to register PUBLISH_FAILURES_TOTAL");
    registry
        .register(Box::new(ALLOCATIONS_TOTAL.clone()))
        .expect("Failed to register ALLOCATIONS_TOTAL");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics should be valid UTF-8")
}

pub fn room_started() {
    ROOMS_ACTIVE.inc();
}

pub fn room_stopped() {
    ROOMS_ACTIVE.dec();
}

pub fn connection_opened() {
    WEBSOCKET_CONNECTIONS_ACTIVE.inc();
}

pub fn connection_closed() {
    WEBSOCKET_CONNECTIONS_ACTIVE.dec();
}

pub fn record_fanout(delivered: u64, dropped: u64) {
    FANOUT_DELIVERED_TOTAL.inc_by(delivered);
    FANOUT_DROPPED_TOTAL.inc_by(dropped);
}

pub fn record_publish_failure(reason: &str) {
    PUBLISH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_allocation(outcome: &str) {
    ALLOCATIONS_TOTAL.with_label_values(&[outcome]).inc();
}
