//! Relay server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this many missed pongs).
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound buffer (frames). A subscriber that falls
    /// this far behind is disconnected and must resync.
    pub outbound_buffer: usize,
    /// How long after its last socket drops before a machine is marked
    /// offline.
    pub machine_offline_grace_secs: u64,
    /// How many updates per account the log retains; `0` disables
    /// pruning. Subscribers below the horizon get `resync-required`.
    pub update_retention: u64,
    /// Seconds the first frame (auth) may take before the socket is
    /// dropped.
    pub auth_timeout_secs: u64,
    /// Ceiling for client-requested RPC timeouts in milliseconds.
    pub max_rpc_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 4 * 1024 * 1024, // 4 MB
            outbound_buffer: 256,
            machine_offline_grace_secs: 30,
            update_retention: 10_000,
            auth_timeout_secs: 5,
            max_rpc_timeout_ms: 60_000,
        }
    }
}
