//! Metrics collection and export for Meteor.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use meteor_transport::FrameOutcome;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "meteor_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "meteor_connections_active";
    pub const SESSIONS_ACTIVE: &str = "meteor_sessions_active";
    pub const FRAMES_TOTAL: &str = "meteor_frames_total";
    pub const MESSAGES_TOTAL: &str = "meteor_messages_total";
    pub const MESSAGES_BYTES: &str = "meteor_messages_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "meteor_subscriptions_total";
    pub const CHANNELS_ACTIVE: &str = "meteor_channels_active";
    pub const DELIVERIES_TOTAL: &str = "meteor_deliveries_total";
    pub const LATENCY_SECONDS: &str = "meteor_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "meteor_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of registered sessions");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of inbound text frames");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of Bayeux messages");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes written to clients");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_gauge!(
        names::CHANNELS_ACTIVE,
        "Current number of subscribed channel patterns"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of broadcast deliveries queued"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

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

/// Update the registered session count.
pub fn set_active_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Record the handling of one inbound frame.
pub fn record_frame(outcome: &FrameOutcome, seconds: f64) {
    counter!(names::FRAMES_TOTAL).increment(1);
    counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(outcome.messages_in as u64);
    record_outbound(outcome);
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record messages written to a client.
pub fn record_outbound(outcome: &FrameOutcome) {
    counter!(names::MESSAGES_TOTAL, "direction" => "outbound")
        .increment(outcome.messages_out as u64);
    counter!(names::MESSAGES_BYTES, "direction" => "outbound").increment(outcome.bytes_out as u64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update the subscribed pattern count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record broadcast fan-out.
pub fn record_deliveries(count: usize) {
    counter!(names::DELIVERIES_TOTAL).increment(count as u64);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
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
