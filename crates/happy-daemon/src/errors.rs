//! Daemon error type.

/// Failures surfaced by the session runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another daemon already owns this state directory.
    #[error("daemon already running (pid {pid}, port {port})")]
    AlreadyRunning {
        /// Its pid.
        pid: u32,
        /// Its control port.
        port: u16,
    },

    /// No daemon is running for this state directory.
    #[error("daemon not running")]
    NotRunning,

    /// Credentials are missing or unreadable.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The relay is unreachable.
    #[error("server unreachable")]
    ServerUnreachable,

    /// Sync layer failure.
    #[error("sync: {0}")]
    Sync(#[from] happy_sync::SyncError),

    /// Crypto failure.
    #[error("crypto: {0}")]
    Crypto(#[from] happy_crypto::CryptoError),

    /// Filesystem or socket I/O.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (state files, IPC frames).
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Session lookup failed.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The assistant child failed to spawn.
    #[error("failed to spawn assistant: {0}")]
    Spawn(String),

    /// Local IPC request failed.
    #[error("ipc: {0}")]
    Ipc(String),

    /// HTTP call to the relay failed.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}
