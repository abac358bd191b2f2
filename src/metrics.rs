//! Prometheus metrics for WorkflowGuard.
//!
//! This module provides application metrics exposed via the /api/metrics
//! endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `wfg_snapshots_total` - Snapshot runs by outcome and snapshot_type
//! - `wfg_rollbacks_total` - Rollback operations by outcome
//! - `wfg_hubspot_requests_total` - Upstream HubSpot requests by method and status
//! - `wfg_rate_limited_total` - Requests rejected by the rate limiter
//! - `wfg_ws_events_total` - WebSocket events broadcast by event type
//!
//! ### Histograms
//! - `wfg_hubspot_request_duration_seconds` - Upstream request duration
//! - `wfg_snapshot_run_duration_seconds` - Full snapshot sweep duration
//!
//! ### Gauges
//! - `wfg_ws_connections` - Currently connected WebSocket clients

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns None if metrics have not been initialized.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match get_prometheus_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Snapshot Metrics
// =============================================================================

/// Record a snapshot attempt for a single workflow.
pub fn record_snapshot(outcome: &str, snapshot_type: &str) {
    counter!(
        "wfg_snapshots_total",
        "outcome" => outcome.to_string(),
        "snapshot_type" => snapshot_type.to_string()
    )
    .increment(1);
}

/// Record the duration of a full scheduled snapshot sweep.
pub fn record_snapshot_run_duration(duration: Duration) {
    histogram!("wfg_snapshot_run_duration_seconds").record(duration.as_secs_f64());
}

/// Record a rollback operation.
pub fn record_rollback(outcome: &str) {
    counter!(
        "wfg_rollbacks_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// HubSpot Client Metrics
// =============================================================================

/// Record an upstream HubSpot API request.
pub fn record_hubspot_request(method: &str, status_code: u16) {
    counter!(
        "wfg_hubspot_requests_total",
        "method" => method.to_string(),
        "status" => status_code.to_string()
    )
    .increment(1);
}

/// Record upstream request duration.
pub fn record_hubspot_duration(duration: Duration, method: &str) {
    histogram!(
        "wfg_hubspot_request_duration_seconds",
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// API Metrics
// =============================================================================

/// Record a request rejected by the per-client rate limiter.
pub fn record_rate_limited(route: &str) {
    counter!(
        "wfg_rate_limited_total",
        "route" => route.to_string()
    )
    .increment(1);
}

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Record a broadcast WebSocket event.
pub fn record_ws_event(event_type: &str) {
    counter!(
        "wfg_ws_events_total",
        "event" => event_type.to_string()
    )
    .increment(1);
}

/// Increment the connected WebSocket clients gauge.
pub fn inc_ws_connections() {
    gauge!("wfg_ws_connections").increment(1.0);
}

/// Decrement the connected WebSocket clients gauge.
pub fn dec_ws_connections() {
    gauge!("wfg_ws_connections").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_init() {
        // Metrics might already be installed by another test, so only
        // assert the render output is non-empty.
        let result = render_metrics();
        assert!(!result.is_empty());
    }
}
