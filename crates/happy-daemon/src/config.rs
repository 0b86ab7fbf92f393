//! Daemon configuration from environment and defaults.

use std::path::PathBuf;

use happy_core::BackoffConfig;

/// Env var overriding the state directory.
pub const HOME_DIR_ENV: &str = "HAPPY_HOME_DIR";
/// Env var overriding the relay endpoint.
pub const SERVER_URL_ENV: &str = "HAPPY_SERVER_URL";

/// Default relay endpoint.
const DEFAULT_SERVER_URL: &str = "https://api.happy.engineering";

/// Runtime configuration for the daemon and its sessions.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// State directory (`~/.happy` unless `HAPPY_HOME_DIR` overrides).
    pub state_dir: PathBuf,
    /// Relay base URL.
    pub server_url: String,
    /// Machine heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Grace period before a stopped child is killed, in seconds.
    pub child_kill_grace_secs: u64,
    /// Shell short-circuit command timeout in seconds.
    pub shell_timeout_secs: u64,
    /// Permission request timeout in seconds; expiry denies.
    pub permission_timeout_secs: u64,
    /// Self-update poll interval in seconds.
    pub update_check_interval_secs: u64,
}

impl DaemonConfig {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Self {
        let state_dir = std::env::var(HOME_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_dir());
        let server_url = std::env::var(SERVER_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_owned());
        Self {
            state_dir,
            server_url,
            ..Self::with_dirs(PathBuf::new(), String::new())
        }
    }

    /// Explicit directories (tests and embedding).
    pub fn with_dirs(state_dir: PathBuf, server_url: String) -> Self {
        Self {
            state_dir,
            server_url,
            heartbeat_interval_secs: 5,
            backoff: BackoffConfig::default(),
            child_kill_grace_secs: 5,
            shell_timeout_secs: 30,
            permission_timeout_secs: 300,
            update_check_interval_secs: 600,
        }
    }

    /// Directory for daily log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Path of the daemon state file.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("daemon.state.json")
    }

    /// Path of the durable sync cursors.
    pub fn cursors_file(&self) -> PathBuf {
        self.state_dir.join("cursors.json")
    }
}

fn default_state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    PathBuf::from(home).join(".happy")
}
