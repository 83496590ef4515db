//! Metrics collection and export for banter.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use banter_core::{PipelineObserver, SessionId};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "banter_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "banter_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "banter_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "banter_messages_total";
    pub const MESSAGES_BYTES: &str = "banter_messages_bytes";
    pub const ROUTED_RECIPIENTS: &str = "banter_routed_recipients_total";
    pub const ROOMS_ACTIVE: &str = "banter_rooms_active";
    pub const OUTBOUND_DROPPED: &str = "banter_outbound_dropped_total";
    pub const SLOW_CONSUMERS: &str = "banter_slow_consumers_disconnected_total";
    pub const ROUTING_ERRORS: &str = "banter_routing_errors_total";
    pub const RATE_LIMITED: &str = "banter_rate_limited_total";
    pub const LATENCY_SECONDS: &str = "banter_latency_seconds";
    pub const ERRORS_TOTAL: &str = "banter_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections rejected at the connection limit"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::ROUTED_RECIPIENTS,
        "Outbound copies produced by routing fan-out"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of live rooms");
    metrics::describe_counter!(
        names::OUTBOUND_DROPPED,
        "Deliveries shed because a session's egress ring was full"
    );
    metrics::describe_counter!(
        names::SLOW_CONSUMERS,
        "Sessions disconnected by the slow-consumer policy"
    );
    metrics::describe_counter!(names::ROUTING_ERRORS, "Routing errors returned to senders");
    metrics::describe_counter!(
        names::RATE_LIMITED,
        "Inbound messages rejected by the rate limiter"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection rejected at the limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a message with a known encoded size.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record a message without a size (decoded frames).
pub fn record_frame(direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
}

/// Record inbound frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a rate-limited inbound message.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED).increment(1);
}

/// Update the live room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Pipeline observer that feeds routing events into the metrics sink.
#[derive(Debug, Default)]
pub struct MetricsObserver;

impl PipelineObserver for MetricsObserver {
    fn outbound_dropped(&self, _session: &SessionId) {
        counter!(names::OUTBOUND_DROPPED).increment(1);
    }

    fn slow_consumer_disconnected(&self, _session: &SessionId) {
        counter!(names::SLOW_CONSUMERS).increment(1);
    }

    fn routing_error(&self, code: u16) {
        counter!(names::ROUTING_ERRORS, "code" => code.to_string()).increment(1);
    }

    fn fanned_out(&self, recipients: usize, _bytes: usize) {
        counter!(names::ROUTED_RECIPIENTS).increment(recipients as u64);
    }
}
