//! Typed rows read back from the database.

use happy_core::entities::{EntityKind, EntityRef, MachineStatus, SessionLifecycle};
use serde::{Deserialize, Serialize};

/// An account row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRow {
    /// Account id.
    pub id: String,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// Last mutation time (epoch ms).
    pub updated_at: i64,
    /// Entity version of the account record itself.
    pub version: u64,
    /// Ciphertext head of the account record.
    pub head_body: Option<String>,
    /// Highest assigned update seq.
    pub last_seq: u64,
    /// Updates at or below this seq have been pruned.
    pub horizon_seq: u64,
}

/// A machine row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRow {
    /// Machine id.
    pub id: String,
    /// Owning account.
    pub account_id: String,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// Last mutation time (epoch ms).
    pub updated_at: i64,
    /// Entity version.
    pub version: u64,
    /// Ciphertext head of the machine record.
    pub head_body: Option<String>,
    /// Cleartext daemon liveness.
    pub status: MachineStatus,
}

/// A session row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    /// Session id (server-assigned).
    pub id: String,
    /// Owning account.
    pub account_id: String,
    /// Client-chosen creation tag (idempotency key for creation).
    pub tag: String,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// Last mutation time (epoch ms).
    pub updated_at: i64,
    /// Entity version.
    pub version: u64,
    /// Ciphertext head of the session record.
    pub head_body: Option<String>,
    /// Cleartext lifecycle; `archived` freezes the message log.
    pub lifecycle: SessionLifecycle,
    /// Highest assigned message seq in this session's log.
    pub last_message_seq: u64,
}

/// One row of the per-account update log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRow {
    /// Owning account.
    pub account_id: String,
    /// Account-wide ordinal.
    pub seq: u64,
    /// Target entity kind.
    pub entity_kind: EntityKind,
    /// Target entity id.
    pub entity_id: String,
    /// Entity version after this update.
    pub version: u64,
    /// Publisher's dedup key.
    pub local_id: String,
    /// Connection that published it.
    pub producer: String,
    /// Ciphertext patch; absent on presence-only updates.
    pub body: Option<String>,
    /// Cleartext daemon-state tag (machine entities).
    pub machine_status: Option<MachineStatus>,
    /// Cleartext lifecycle tag (session entities).
    pub lifecycle: Option<SessionLifecycle>,
    /// Server receive time (epoch ms).
    pub created_at: i64,
}

impl UpdateRow {
    /// Ref to the entity this update targets.
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.entity_kind,
            id: self.entity_id.clone(),
        }
    }
}

/// One row of a session message log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    /// Owning account.
    pub account_id: String,
    /// Owning session.
    pub session_id: String,
    /// Position in the session log.
    pub seq: u64,
    /// Stable message id.
    pub id: String,
    /// Appender's dedup key.
    pub local_id: String,
    /// Connection that appended it.
    pub producer: String,
    /// Ciphertext payload.
    pub body: String,
    /// Server receive time (epoch ms).
    pub created_at: i64,
}

// String codecs for the cleartext tag columns.

pub(crate) fn machine_status_to_str(s: MachineStatus) -> &'static str {
    match s {
        MachineStatus::Online => "online",
        MachineStatus::Offline => "offline",
        MachineStatus::Shutdown => "shutdown",
    }
}

pub(crate) fn machine_status_from_str(s: &str) -> MachineStatus {
    match s {
        "online" => MachineStatus::Online,
        "shutdown" => MachineStatus::Shutdown,
        _ => MachineStatus::Offline,
    }
}

pub(crate) fn lifecycle_to_str(l: SessionLifecycle) -> &'static str {
    match l {
        SessionLifecycle::Running => "running",
        SessionLifecycle::Archived => "archived",
    }
}

pub(crate) fn lifecycle_from_str(s: &str) -> SessionLifecycle {
    match s {
        "archived" => SessionLifecycle::Archived,
        _ => SessionLifecycle::Running,
    }
}

pub(crate) fn entity_kind_to_str(k: EntityKind) -> &'static str {
    match k {
        EntityKind::Account => "account",
        EntityKind::Machine => "machine",
        EntityKind::Session => "session",
    }
}

pub(crate) fn entity_kind_from_str(s: &str) -> EntityKind {
    match s {
        "account" => EntityKind::Account,
        "machine" => EntityKind::Machine,
        _ => EntityKind::Session,
    }
}
