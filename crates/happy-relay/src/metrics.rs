//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Build a recorder without installing it globally (for tests).
pub fn test_recorder() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// Updates published total (counter, labels: outcome).
pub const UPDATES_PUBLISHED_TOTAL: &str = "updates_published_total";
/// Messages appended total (counter, labels: outcome).
pub const MESSAGES_APPENDED_TOTAL: &str = "messages_appended_total";
/// Frames fanned out total (counter, labels: kind).
pub const FANOUT_FRAMES_TOTAL: &str = "fanout_frames_total";
/// Subscribers disconnected for falling behind (counter).
pub const FANOUT_KICKS_TOTAL: &str = "fanout_kicks_total";
/// RPC calls brokered total (counter, labels: outcome).
pub const RPC_CALLS_TOTAL: &str = "rpc_calls_total";
/// RPC broker round-trip seconds (histogram).
pub const RPC_CALL_DURATION_SECONDS: &str = "rpc_call_duration_seconds";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_renders_empty() {
        let handle = test_recorder();
        // No metrics recorded on this recorder yet
        let rendered = handle.render();
        assert!(rendered.is_empty() || !rendered.contains("panic"));
    }

    #[test]
    fn constant_names_are_snake_case() {
        for name in [
            UPDATES_PUBLISHED_TOTAL,
            MESSAGES_APPENDED_TOTAL,
            FANOUT_FRAMES_TOTAL,
            FANOUT_KICKS_TOTAL,
            RPC_CALLS_TOTAL,
            WS_CONNECTIONS_TOTAL,
        ] {
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
