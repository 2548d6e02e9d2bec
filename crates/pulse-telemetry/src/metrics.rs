//! Prometheus metrics for pulse.
//!
//! Covers:
//! - Push connection state and reconnects
//! - Polling ticks and aborted ticks
//! - Received events and normalized/dropped rows
//! - Mover list publication and row reuse
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Gauge, GaugeVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

/// Connection states reported on [`CONNECTION_STATE`].
const CONNECTION_STATES: &[&str] = &[
    "disconnected",
    "connecting",
    "connected",
    "degraded",
    "reconnecting",
    "failed",
    "polling_fallback",
];

/// Push channel open (1) or not (0).
pub static PUSH_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pulse_push_connected", "Push channel open (1=open)").unwrap()
});

/// Connection state machine current state.
/// Labels: state
pub static CONNECTION_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "pulse_connection_state",
        "Connection state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total push reconnect attempts.
pub static RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("pulse_reconnect_total", "Total push reconnect attempts").unwrap()
});

/// Total push failures after the reconnect budget was spent.
pub static PUSH_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulse_push_failed_total",
        "Times the push channel gave up and fell back to polling"
    )
    .unwrap()
});

/// Polling ticks.
/// Labels: outcome (complete/aborted)
pub static POLL_TICKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_poll_ticks_total",
        "Total polling ticks by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Failed poll requests.
pub static POLL_REQUESTS_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "pulse_poll_requests_failed_total",
        "Total failed poll requests"
    )
    .unwrap()
});

/// Events received from push or poll.
/// Labels: event
pub static EVENTS_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_events_received_total",
        "Total events received by name",
        &["event"]
    )
    .unwrap()
});

/// Rows that survived normalization.
/// Labels: stream
pub static ROWS_NORMALIZED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_rows_normalized_total",
        "Total rows produced by the normalizer",
        &["stream"]
    )
    .unwrap()
});

/// Rows the normalizer dropped.
/// Labels: stream
pub static ROWS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_rows_dropped_total",
        "Total raw rows the normalizer could not use",
        &["stream"]
    )
    .unwrap()
});

/// Mover lists published.
/// Labels: list
pub static LIST_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_list_published_total",
        "Total mover lists published",
        &["list"]
    )
    .unwrap()
});

/// Current mover list length.
/// Labels: list
pub static LIST_LENGTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("pulse_list_length", "Current mover list length", &["list"])
        .unwrap()
});

/// Rows reused from the previous list.
/// Labels: list
pub static ROWS_REUSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_rows_reused_total",
        "Total rows reused unchanged from the previous list",
        &["list"]
    )
    .unwrap()
});

/// Watchlist size.
pub static WATCHLIST_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pulse_watchlist_size", "Number of watched symbols").unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the connection state. Only the active state is 1.
    pub fn connection_state_set(state: &str) {
        for s in CONNECTION_STATES {
            CONNECTION_STATE.with_label_values(&[s]).set(0.0);
        }
        CONNECTION_STATE.with_label_values(&[state]).set(1.0);

        let open = matches!(state, "connected" | "degraded");
        PUSH_CONNECTED.set(if open { 1.0 } else { 0.0 });
    }

    pub fn reconnect_attempt() {
        RECONNECT_TOTAL.inc();
    }

    pub fn push_failed() {
        PUSH_FAILED_TOTAL.inc();
    }

    /// Record a polling tick.
    pub fn poll_tick(aborted: bool, failed_requests: usize) {
        let outcome = if aborted { "aborted" } else { "complete" };
        POLL_TICKS_TOTAL.with_label_values(&[outcome]).inc();
        POLL_REQUESTS_FAILED_TOTAL.inc_by(failed_requests as u64);
    }

    pub fn event_received(event: &str) {
        EVENTS_RECEIVED_TOTAL.with_label_values(&[event]).inc();
    }

    /// Record one normalization pass over `raw` rows yielding `kept`.
    pub fn rows_normalized(stream: &str, raw: usize, kept: usize) {
        ROWS_NORMALIZED_TOTAL
            .with_label_values(&[stream])
            .inc_by(kept as u64);
        ROWS_DROPPED_TOTAL
            .with_label_values(&[stream])
            .inc_by(raw.saturating_sub(kept) as u64);
    }

    /// Record a published list.
    pub fn list_published(list: &str, len: usize, reused: usize) {
        LIST_PUBLISHED_TOTAL.with_label_values(&[list]).inc();
        LIST_LENGTH.with_label_values(&[list]).set(len as i64);
        ROWS_REUSED_TOTAL
            .with_label_values(&[list])
            .inc_by(reused as u64);
    }

    pub fn watchlist_size(len: usize) {
        WATCHLIST_SIZE.set(len as i64);
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> TelemetryResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
