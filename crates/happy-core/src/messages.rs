//! Session message log entries.
//!
//! [`MessageBody`] is the plaintext a client encrypts into a message
//! envelope. The variant set is closed — remote clients and the CLI agree
//! on exactly these four kinds. Tool-call children are flat id references
//! owned by the parent; lookups go through the session message map, never
//! through pointers, so the structure cannot cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{LocalId, MessageId};

/// Progress of a tool call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    /// Emitted, not yet resolved.
    #[default]
    Running,
    /// Tool finished successfully.
    Completed,
    /// Tool failed or was denied.
    Failed,
}

/// Lifecycle signals the CLI pushes into the log as `agent-event` messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AgentEvent {
    /// Control mode changed (`local` ↔ `remote`).
    SwitchMode {
        /// `true` when the local terminal took control.
        controlled_by_user: bool,
    },
    /// The assistant hit a usage or context limit.
    LimitReached {
        /// Human-readable limit description.
        reason: String,
    },
    /// Turn complete; cumulative usage attached.
    Ready {
        /// Opaque usage counters as reported by the assistant.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    /// The assistant asked to run a tool and needs consent.
    PermissionRequest {
        /// Correlates the eventual allow/deny RPC.
        request_id: String,
        /// Tool the assistant wants to run.
        tool_name: String,
        /// Tool arguments as reported by the assistant.
        arguments: Value,
    },
    /// Terminal event: the session ended.
    SessionDeath {
        /// Exit code of the assistant child, if it exited on its own.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Crash or termination reason, if abnormal.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// The plaintext body of one message envelope. Closed tagged union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessageBody {
    /// Text typed by the user (terminal or remote client).
    UserText {
        /// The text.
        text: String,
    },
    /// Text produced by the assistant.
    AgentText {
        /// The text.
        text: String,
    },
    /// A tool invocation, with nested sub-step messages referenced by id.
    ToolCall {
        /// Tool name.
        tool_name: String,
        /// Assistant-assigned call id.
        call_id: String,
        /// Tool arguments.
        arguments: Value,
        /// Current status.
        #[serde(default)]
        status: ToolCallStatus,
        /// Ordered child message ids (flat refs, appended as sub-steps land).
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<MessageId>,
    },
    /// A lifecycle signal from the CLI.
    AgentEvent {
        /// The event payload.
        #[serde(flatten)]
        event: AgentEvent,
    },
}

impl MessageBody {
    /// Wire discriminator for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserText { .. } => "user-text",
            Self::AgentText { .. } => "agent-text",
            Self::ToolCall { .. } => "tool-call",
            Self::AgentEvent { .. } => "agent-event",
        }
    }
}

/// A decrypted message as seen by clients: stable identity plus body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// Stable message id.
    pub id: MessageId,
    /// Client dedup key; two appends with the same value coalesce.
    pub local_id: LocalId,
    /// Server-assigned position in the session log.
    pub seq: u64,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// The body.
    pub body: MessageBody,
}
