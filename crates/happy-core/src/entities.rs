//! Entity model: refs, scopes, and the cleartext shape of machine and
//! session records.
//!
//! The relay only ever sees [`EntityRef`]/[`Scope`] plus version counters —
//! the structured records in this module live inside encrypted update
//! bodies and are only decoded client-side.

use serde::{Deserialize, Serialize};

use crate::ids::{MachineId, SessionId};

/// Kind discriminator for entities the relay versions and routes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The account principal itself.
    Account,
    /// A host running the CLI daemon.
    Machine,
    /// One assistant conversation.
    Session,
}

/// Reference to a versioned entity. Cleartext on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id (account / machine / session id).
    pub id: String,
}

impl EntityRef {
    /// Ref to an account entity.
    pub fn account(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Account,
            id: id.into(),
        }
    }

    /// Ref to a machine entity.
    pub fn machine(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Machine,
            id: id.into(),
        }
    }

    /// Ref to a session entity.
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Session,
            id: id.into(),
        }
    }

    /// The scope this entity's updates are routed to.
    pub fn scope(&self) -> Scope {
        let kind = match self.kind {
            EntityKind::Account => ScopeKind::Account,
            EntityKind::Machine => ScopeKind::Machine,
            EntityKind::Session => ScopeKind::Session,
        };
        Scope {
            kind,
            id: self.id.clone(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            EntityKind::Account => "account",
            EntityKind::Machine => "machine",
            EntityKind::Session => "session",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

/// Kind discriminator for routing scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Everything owned by the account.
    Account,
    /// One machine's updates and events.
    Machine,
    /// One session's updates and events.
    Session,
}

/// A routing key a connection subscribes to. Cleartext on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Scope kind.
    pub kind: ScopeKind,
    /// Scope id (account / machine / session id).
    pub id: String,
}

impl Scope {
    /// Account-wide scope.
    pub fn account(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Account,
            id: id.into(),
        }
    }

    /// Machine scope.
    pub fn machine(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Machine,
            id: id.into(),
        }
    }

    /// Session scope.
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Session,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ScopeKind::Account => "account",
            ScopeKind::Machine => "machine",
            ScopeKind::Session => "session",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

/// Which assistant implementation a session runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// Claude Code (the default).
    #[default]
    Claude,
    /// Codex.
    Codex,
    /// Gemini.
    Gemini,
}

impl Flavor {
    /// Env var naming the default model for this flavor.
    pub fn model_env_var(self) -> &'static str {
        match self {
            Self::Claude => "ANTHROPIC_MODEL",
            Self::Codex => "OPENAI_MODEL",
            Self::Gemini => "GEMINI_MODEL",
        }
    }
}

impl std::str::FromStr for Flavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("unknown flavor '{other}'")),
        }
    }
}

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    /// The assistant child is (or may be) running; log accepts appends.
    #[default]
    Running,
    /// Terminal state; the message log is immutable.
    Archived,
}

/// Daemon liveness as observed through the machine record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Daemon socket is connected.
    Online,
    /// Heartbeat lost; daemon presumed dead.
    #[default]
    Offline,
    /// Daemon exited gracefully.
    Shutdown,
}

/// Policy governing which of the assistant's tool calls require consent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Ask for every mutating tool.
    #[default]
    Default,
    /// Auto-approve file edits, ask for the rest.
    AcceptEdits,
    /// Planning only; plan approvals may be auto-resolved.
    Plan,
    /// Approve everything without asking.
    BypassPermissions,
}

/// Presence bits for a running session. Lives inside encrypted bodies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    /// The assistant is mid-turn.
    pub thinking: bool,
    /// `true` while the local terminal owns input (`local` control mode).
    pub controlled_by_user: bool,
    /// Model currently in effect, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_model: Option<String>,
}

/// Session metadata document. Lives inside encrypted bodies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Owning machine.
    pub machine_id: MachineId,
    /// Working directory the assistant runs in.
    pub working_dir: String,
    /// Assistant implementation.
    pub flavor: Flavor,
    /// Lifecycle state.
    pub lifecycle: SessionLifecycle,
    /// Permission policy for tool calls.
    pub permission_mode: PermissionMode,
    /// Tool names the assistant may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Model override, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Host the session runs on (informational).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Machine metadata document. Lives inside encrypted bodies; writes are
/// exclusive to the owning daemon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    /// Host name.
    pub hostname: String,
    /// Home directory of the daemon user.
    pub home_dir: String,
    /// Operating system tag.
    pub os: String,
    /// Daemon liveness.
    pub status: MachineStatus,
    /// Sessions currently supervised by the daemon.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_sessions: Vec<SessionId>,
}
