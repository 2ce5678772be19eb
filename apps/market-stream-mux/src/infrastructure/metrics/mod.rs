//! Prometheus Metrics Module
//!
//! Exposes multiplexer metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received and frames that failed to decode, per topic
//! - **Dispatch**: Messages delivered to handlers and handler failures
//! - **Connections**: Open physical connections, transport errors, reconnects
//! - **Subscriptions**: Active topics and subscribers
//! - **Latency**: Time to establish a topic connection
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::topic::Topic;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again after a successful install returns the same handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "stream_mux_frames_received_total",
        "Total frames received from topic streams"
    );
    describe_counter!(
        "stream_mux_decode_errors_total",
        "Total frames dropped because they could not be decoded"
    );

    // Dispatch counters
    describe_counter!(
        "stream_mux_messages_dispatched_total",
        "Total handler invocations that completed successfully"
    );
    describe_counter!(
        "stream_mux_handler_errors_total",
        "Total handler invocations that failed or panicked"
    );

    // Connection metrics
    describe_gauge!(
        "stream_mux_open_connections",
        "Number of open physical topic connections"
    );
    describe_counter!(
        "stream_mux_transport_errors_total",
        "Total transport errors by kind"
    );
    describe_counter!(
        "stream_mux_reconnects_total",
        "Total scheduled reconnection attempts"
    );

    // Subscription gauges
    describe_gauge!(
        "stream_mux_active_topics",
        "Number of topics with at least one subscriber"
    );
    describe_gauge!(
        "stream_mux_active_subscribers",
        "Number of active subscriptions across all topics"
    );

    // Latency histograms
    describe_histogram!(
        "stream_mux_connect_seconds",
        "Time to establish a topic connection"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFailure {
    /// Handler returned an error.
    Error,
    /// Handler panicked.
    Panic,
}

impl HandlerFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// Record a frame received on a topic.
pub fn record_frame_received(topic: &Topic) {
    counter!(
        "stream_mux_frames_received_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(topic: &Topic) {
    counter!(
        "stream_mux_decode_errors_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record successful handler invocations.
pub fn record_messages_dispatched(count: u64) {
    if count > 0 {
        counter!("stream_mux_messages_dispatched_total").increment(count);
    }
}

/// Record a failed handler invocation.
pub fn record_handler_error(failure: HandlerFailure) {
    counter!(
        "stream_mux_handler_errors_total",
        "failure" => failure.as_str()
    )
    .increment(1);
}

/// Record a physical connection becoming open.
pub fn connection_opened() {
    gauge!("stream_mux_open_connections").increment(1.0);
}

/// Record a physical connection going away.
pub fn connection_closed() {
    gauge!("stream_mux_open_connections").decrement(1.0);
}

/// Record a transport error.
pub fn record_transport_error(kind: &'static str) {
    counter!(
        "stream_mux_transport_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect(topic: &Topic) {
    counter!(
        "stream_mux_reconnects_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Update the active topic count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_topics(count: usize) {
    gauge!("stream_mux_active_topics").set(count as f64);
}

/// Update the active subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscribers(count: usize) {
    gauge!("stream_mux_active_subscribers").set(count as f64);
}

/// Record how long a connection attempt took to succeed.
pub fn record_connect_latency(duration: Duration) {
    histogram!("stream_mux_connect_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
