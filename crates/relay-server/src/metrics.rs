//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "relay_subscribers_active";
    pub const PUBLISHES_TOTAL: &str = "relay_publishes_total";
    pub const PUBLISH_BYTES: &str = "relay_publish_bytes_total";
    pub const BROADCAST_LATENCY_SECONDS: &str = "relay_broadcast_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of subscriptions since server start"
    );
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of registered subscribers"
    );
    metrics::describe_counter!(
        names::PUBLISHES_TOTAL,
        "Total number of publish requests by result"
    );
    metrics::describe_counter!(names::PUBLISH_BYTES, "Total bytes of published payloads");
    metrics::describe_histogram!(
        names::BROADCAST_LATENCY_SECONDS,
        "Time to fan a message out to every subscriber, in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the registered subscriber count.
pub fn set_active_subscribers(count: usize) {
    gauge!(names::SUBSCRIBERS_ACTIVE).set(count as f64);
}

/// Record a publish and its outcome.
pub fn record_publish(bytes: usize, kind: &'static str, result: &'static str) {
    counter!(names::PUBLISHES_TOTAL, "kind" => kind, "result" => result).increment(1);
    counter!(names::PUBLISH_BYTES, "kind" => kind).increment(bytes as u64);
}

/// Record how long a broadcast took.
pub fn record_broadcast_latency(seconds: f64) {
    histogram!(names::BROADCAST_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
