//! # happy-core
//!
//! Shared vocabulary for the Happy session sync and control plane: branded
//! IDs, the entity model, the session message tagged union, the wire
//! protocol frames exchanged between sync clients and the relay, the error
//! taxonomy, and backoff math.
//!
//! Everything here is transport-agnostic and content-blind: the encrypted
//! `body` fields are opaque base64 strings at this layer.

#![deny(unsafe_code)]

pub mod entities;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod protocol;
pub mod retry;

pub use entities::{
    AgentState, EntityKind, EntityRef, Flavor, MachineRecord, MachineStatus, PermissionMode,
    Scope, ScopeKind, SessionLifecycle, SessionMetadata,
};
pub use errors::CoreError;
pub use ids::{AccountId, CallId, ConnectionId, LocalId, MachineId, MessageId, SessionId};
pub use messages::{AgentEvent, MessageBody, SessionMessage, ToolCallStatus};
pub use protocol::{
    ClientFrame, ConnectionKind, RejectReason, RpcFailure, ServerFrame,
};
pub use retry::BackoffConfig;

/// Current UTC timestamp in epoch milliseconds (the wire clock).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_recent() {
        // 2020-01-01 in epoch millis
        assert!(now_ms() > 1_577_836_800_000);
    }
}
