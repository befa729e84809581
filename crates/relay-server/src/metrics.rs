//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// Commands dispatched total (counter, labels: command).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Command dispatch errors total (counter, labels: command, code).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Command dispatch duration seconds (histogram, labels: command).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Messages dropped on full send channels (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Connections evicted by identity takeover (counter).
pub const WS_TAKEOVERS_TOTAL: &str = "ws_takeovers_total";
/// Connections evicted by missed heartbeats (counter).
pub const WS_HEARTBEAT_EVICTIONS_TOTAL: &str = "ws_heartbeat_evictions_total";
/// Events delivered to listeners (counter).
pub const EVENTS_DELIVERED_TOTAL: &str = "events_delivered_total";
/// Upload bytes written (counter).
pub const UPLOAD_BYTES_TOTAL: &str = "upload_bytes_total";
/// Uploads committed (counter).
pub const UPLOADS_COMMITTED_TOTAL: &str = "uploads_committed_total";
