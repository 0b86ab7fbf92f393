//! Durable subscription cursors.
//!
//! `lastSeq` per scope (and `lastMessageSeq` per session) survive process
//! restarts so a daemon that comes back can resume its subscriptions
//! without a full resync. The file is written atomically (temp + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk cursor document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursors {
    /// scope string (`kind:id`) → last applied update seq.
    #[serde(default)]
    pub updates: HashMap<String, u64>,
    /// session id → last applied message seq.
    #[serde(default)]
    pub messages: HashMap<String, u64>,
}

/// File-backed cursor store.
pub struct CursorStore {
    path: Option<PathBuf>,
    cursors: Cursors,
}

impl CursorStore {
    /// In-memory only (cursors lost on restart).
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            cursors: Cursors::default(),
        }
    }

    /// Load cursors from `path`, starting empty if absent or invalid.
    pub fn open(path: PathBuf) -> Self {
        let cursors = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();
        Self {
            path: Some(path),
            cursors,
        }
    }

    /// Last applied update seq for a scope.
    pub fn update_seq(&self, scope: &str) -> u64 {
        self.cursors.updates.get(scope).copied().unwrap_or(0)
    }

    /// Last applied message seq for a session.
    pub fn message_seq(&self, session_id: &str) -> u64 {
        self.cursors.messages.get(session_id).copied().unwrap_or(0)
    }

    /// Advance an update cursor (never moves backwards) and persist.
    pub fn advance_update(&mut self, scope: &str, seq: u64) {
        let entry = self.cursors.updates.entry(scope.to_owned()).or_insert(0);
        if seq > *entry {
            *entry = seq;
            self.persist();
        }
    }

    /// Advance a message cursor (never moves backwards) and persist.
    pub fn advance_message(&mut self, session_id: &str, seq: u64) {
        let entry = self.cursors.messages.entry(session_id.to_owned()).or_insert(0);
        if seq > *entry {
            *entry = seq;
            self.persist();
        }
    }

    /// Reset a scope's update cursor to a snapshot floor (after a full
    /// resync) and persist.
    pub fn reset_update(&mut self, scope: &str, seq: u64) {
        let _ = self.cursors.updates.insert(scope.to_owned(), seq);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(json) = serde_json::to_string_pretty(&self.cursors) else {
            return;
        };
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, json).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}

/// Default cursor file location under a state directory.
pub fn cursor_path(state_dir: &Path) -> PathBuf {
    state_dir.join("cursors.json")
}
