//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use herald_core::DispatchReport;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const TOPICS_ACTIVE: &str = "herald_topics_active";
    pub const EVENTS_SUBMITTED: &str = "herald_events_submitted_total";
    pub const EVENTS_REJECTED: &str = "herald_events_rejected_total";
    pub const DELIVERIES_TOTAL: &str = "herald_deliveries_total";
    pub const QUEUE_DROPS_TOTAL: &str = "herald_queue_drops_total";
    pub const TOKENS_REJECTED: &str = "herald_tokens_rejected_total";
    pub const DISPATCH_SECONDS: &str = "herald_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of event streams opened since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open event streams"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics with at least one subscriber");
    metrics::describe_counter!(names::EVENTS_SUBMITTED, "Events accepted from publishers");
    metrics::describe_counter!(names::EVENTS_REJECTED, "Malformed events refused");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Events queued for a subscriber");
    metrics::describe_counter!(
        names::QUEUE_DROPS_TOTAL,
        "Events lost to a full or closed subscriber queue"
    );
    metrics::describe_counter!(names::TOKENS_REJECTED, "Tokens refused, by reason");
    metrics::describe_histogram!(names::DISPATCH_SECONDS, "Submission dispatch latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of request errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record the outcome of a dispatched submission.
pub fn record_dispatch(report: &DispatchReport, seconds: f64) {
    counter!(names::EVENTS_SUBMITTED).increment(report.accepted as u64);
    counter!(names::EVENTS_REJECTED).increment(report.rejected.len() as u64);
    counter!(names::DELIVERIES_TOTAL).increment(report.deliveries as u64);
    counter!(names::QUEUE_DROPS_TOTAL).increment(report.dropped as u64);
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record a refused token.
pub fn record_token_rejected(reason: &'static str) {
    counter!(names::TOKENS_REJECTED, "reason" => reason).increment(1);
}

/// Update active topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_dispatch(&DispatchReport::default(), 0.0);
        record_token_rejected("invalid_token");
        set_active_topics(3);
    }
}
