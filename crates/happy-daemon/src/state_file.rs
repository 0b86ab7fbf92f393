//! Daemon state file: single-instance lock and discovery point.
//!
//! The running daemon writes `{pid, port, token, version, startedAt}` so
//! short-lived `happy` invocations can find and authenticate to its
//! control socket. Writes are atomic (temp + rename) so a crash never
//! leaves a torn file. Liveness is probed by connecting to the recorded
//! port — a stale file from a killed daemon is reclaimed, a live one
//! rejects the second daemon.

use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DaemonError;

/// On-disk daemon state document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    /// Daemon process id.
    pub pid: u32,
    /// Control IPC port on loopback.
    pub port: u16,
    /// Token a local client must present on the control socket.
    pub token: String,
    /// Daemon package version.
    pub version: String,
    /// Start time (epoch ms).
    pub started_at: i64,
}

/// Load the state file if present and parseable.
pub fn load(path: &Path) -> Option<DaemonState> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Atomically write the state file.
pub fn save(path: &Path, state: &DaemonState) -> Result<(), DaemonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Remove the state file (graceful shutdown).
pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Whether the daemon recorded in `state` is still alive, probed by
/// connecting to its control port.
pub fn is_alive(state: &DaemonState) -> bool {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, state.port);
    TcpStream::connect_timeout(&addr.into(), Duration::from_millis(500)).is_ok()
}

/// Guard against a second daemon on the same state directory.
///
/// Returns the stale state (if any) when the directory is free; fails
/// with [`DaemonError::AlreadyRunning`] when a live daemon owns it.
pub fn claim(path: &Path) -> Result<Option<DaemonState>, DaemonError> {
    match load(path) {
        Some(existing) if is_alive(&existing) => Err(DaemonError::AlreadyRunning {
            pid: existing.pid,
            port: existing.port,
        }),
        other => Ok(other),
    }
}
