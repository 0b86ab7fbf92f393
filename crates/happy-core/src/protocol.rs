//! Wire protocol frames: the bidirectional JSON-object stream between a
//! sync client and the relay.
//!
//! Protocol fields (`seq`, `version`, entity refs, scope tags, lifecycle
//! and presence tags, timestamps) are cleartext; every `body` / `request`
//! / `response` field is a base64 encryption envelope the relay never
//! parses.
//!
//! Two delivery channels share the socket:
//! - **updates** — versioned deltas on entities, totally ordered by the
//!   per-account `seq`, subject to optimistic concurrency;
//! - **messages** — the append-only session log, ordered by a per-session
//!   `seq`, idempotent on `localId`, never versioned (appends from the
//!   CLI and remote clients must not conflict with each other).

use serde::{Deserialize, Serialize};

use crate::entities::{EntityRef, MachineStatus, Scope, SessionLifecycle};
use crate::ids::{AccountId, CallId, ConnectionId, LocalId, MessageId, SessionId};

/// Initial scope a connection is auto-subscribed to; also bounds what it
/// may additionally subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Subscribed to the whole account scope.
    UserScoped,
    /// Subscribed to a single session (requires `scopeRef`).
    SessionScoped,
    /// Subscribed to a single machine (requires `scopeRef`).
    MachineScoped,
}

/// Why the server rejected a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// `expectedVersion` did not match the entity's current version.
    VersionMismatch,
    /// The connection is not authorized for this entity, or the target
    /// log is immutable (archived session).
    Auth,
    /// Server-advised retry-later.
    RateLimit,
}

/// Terminal failure of a brokered RPC call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcFailure {
    /// No handler registered for `(scope, method)`.
    NoHandler,
    /// The handler did not respond within `timeoutMs`.
    Timeout,
    /// The handler connection vanished mid-call.
    Transport,
}

/// Frames a client sends to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame on every connection.
    Auth {
        /// Bearer credential.
        token: String,
        /// Connection kind (determines the automatic subscription).
        connection_kind: ConnectionKind,
        /// Session or machine id for scoped kinds.
        #[serde(skip_serializing_if = "Option::is_none")]
        scope_ref: Option<String>,
    },
    /// Subscribe to an additional scope owned by the account.
    Subscribe {
        /// The scope.
        scope: Scope,
        /// Update cursor; the server replays updates with `seq > sinceSeq`.
        #[serde(skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
        /// Message cursor for session scopes; the server replays log
        /// entries with `seq > sinceMessageSeq`.
        #[serde(skip_serializing_if = "Option::is_none")]
        since_message_seq: Option<u64>,
    },
    /// Publish a versioned update.
    Update {
        /// Target entity.
        #[serde(rename = "entityRef")]
        entity: EntityRef,
        /// Optimistic concurrency guard.
        expected_version: u64,
        /// Idempotency key.
        local_id: LocalId,
        /// Encrypted patch (base64 envelope). Absent on presence-only
        /// updates.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Cleartext daemon-state tag on machine entities.
        #[serde(skip_serializing_if = "Option::is_none")]
        machine_status: Option<MachineStatus>,
        /// Cleartext lifecycle tag on session entities. Setting
        /// `archived` freezes the session's message log.
        #[serde(skip_serializing_if = "Option::is_none")]
        lifecycle: Option<SessionLifecycle>,
    },
    /// Append a message to a session log.
    Message {
        /// Target session.
        session_id: SessionId,
        /// Idempotency key; a retried append coalesces to the first.
        local_id: LocalId,
        /// Encrypted message payload.
        body: String,
    },
    /// Fire-and-forget transient signal.
    Ephemeral {
        /// Routing scope.
        scope: Scope,
        /// Signal kind (typing, presence, usage ...).
        kind: String,
        /// Sender clock (epoch ms).
        ts: i64,
        /// Optional encrypted payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    /// Invoke an RPC on whichever connection handles `(targetScope, method)`.
    RpcCall {
        /// Correlation id.
        call_id: CallId,
        /// Scope whose handler should serve the call.
        target_scope: Scope,
        /// Method name (e.g. `session.readFile`).
        method: String,
        /// Budget for the round trip.
        timeout_ms: u64,
        /// Encrypted request body.
        request: String,
    },
    /// Respond to a brokered call previously forwarded to this connection.
    RpcResponse {
        /// Correlation id from the forwarded call.
        call_id: CallId,
        /// Whether the handler succeeded.
        ok: bool,
        /// Encrypted response body on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        /// Encrypted error body on handler failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_body: Option<String>,
    },
    /// Register this connection as the handler for `(scope, method)`.
    /// Most recent registration wins.
    RpcRegister {
        /// Scope the handler serves.
        scope: Scope,
        /// Method name.
        method: String,
    },
    /// Liveness probe.
    Heartbeat {
        /// Sender clock (epoch ms).
        ts: i64,
    },
}

/// Frames the relay sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Authentication accepted.
    AuthOk {
        /// Stable id of this connection (used for self-echo suppression).
        connection_id: ConnectionId,
        /// Resolved account.
        account_id: AccountId,
        /// Server clock (epoch ms).
        server_time: i64,
    },
    /// Authentication refused; the server closes the socket after this.
    AuthReject {
        /// Human-readable reason. Never carries credentials.
        reason: String,
    },
    /// Subscription accepted; replay (if any) follows, then the live tail.
    Subscribed {
        /// The scope.
        scope: Scope,
        /// The account update seq at the time of subscription.
        since_seq: u64,
        /// The session message seq at the time of subscription (session
        /// scopes only).
        #[serde(skip_serializing_if = "Option::is_none")]
        since_message_seq: Option<u64>,
    },
    /// A persisted update delivered to a subscriber.
    Update {
        /// Source entity.
        #[serde(rename = "entityRef")]
        entity: EntityRef,
        /// Entity version after this update.
        version: u64,
        /// Account-wide ordinal.
        seq: u64,
        /// Connection that published it (`server` for relay-authored
        /// presence updates).
        producer: ConnectionId,
        /// Publisher's dedup key.
        local_id: LocalId,
        /// Encrypted patch (opaque to the relay). Absent on presence-only
        /// updates.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Cleartext daemon-state tag on machine entities.
        #[serde(skip_serializing_if = "Option::is_none")]
        machine_status: Option<MachineStatus>,
        /// Cleartext lifecycle tag on session entities.
        #[serde(skip_serializing_if = "Option::is_none")]
        lifecycle: Option<SessionLifecycle>,
    },
    /// Publish acknowledged and durable.
    UpdateAck {
        /// Echoed dedup key.
        local_id: LocalId,
        /// Assigned ordinal.
        seq: u64,
        /// Entity version after the update.
        new_version: u64,
    },
    /// Publish refused.
    UpdateReject {
        /// Echoed dedup key.
        local_id: LocalId,
        /// Why.
        reason: RejectReason,
        /// Authoritative version on version-mismatch.
        #[serde(skip_serializing_if = "Option::is_none")]
        current_version: Option<u64>,
        /// Authoritative body on version-mismatch (still ciphertext).
        #[serde(skip_serializing_if = "Option::is_none")]
        current_body: Option<String>,
    },
    /// A message appended to a session log, delivered to subscribers.
    Message {
        /// Source session.
        session_id: SessionId,
        /// Stable message id.
        message_id: MessageId,
        /// Position in the session log.
        seq: u64,
        /// Connection that appended it.
        producer: ConnectionId,
        /// Appender's dedup key.
        local_id: LocalId,
        /// Server receive time (epoch ms).
        created_at: i64,
        /// Encrypted message payload.
        body: String,
    },
    /// Append acknowledged (or coalesced onto an earlier append with the
    /// same `localId`).
    MessageAck {
        /// Echoed dedup key.
        local_id: LocalId,
        /// Target session.
        session_id: SessionId,
        /// Stable message id (of the first append that landed).
        message_id: MessageId,
        /// Position in the session log.
        seq: u64,
    },
    /// Transient signal fan-out.
    Ephemeral {
        /// Routing scope.
        scope: Scope,
        /// Signal kind.
        kind: String,
        /// Sender clock (epoch ms).
        ts: i64,
        /// Optional encrypted payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    /// An RPC call forwarded to this connection (it is the handler).
    RpcCall {
        /// Correlation id; echo it in the response.
        call_id: CallId,
        /// Scope the call targets.
        target_scope: Scope,
        /// Method name.
        method: String,
        /// Remaining budget.
        timeout_ms: u64,
        /// Encrypted request body.
        request: String,
    },
    /// Response to a call this connection made.
    RpcResponse {
        /// Correlation id.
        call_id: CallId,
        /// Whether the handler succeeded.
        ok: bool,
        /// Encrypted response body on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        /// Encrypted error body on handler failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_body: Option<String>,
    },
    /// A call this connection made failed without a handler response.
    RpcError {
        /// Correlation id.
        call_id: CallId,
        /// Terminal failure reason.
        reason: RpcFailure,
    },
    /// Liveness probe / echo.
    Heartbeat {
        /// Server clock (epoch ms).
        ts: i64,
    },
    /// The requested cursor is below the retention horizon; the client
    /// must refetch a snapshot.
    ResyncRequired {
        /// Affected scope.
        scope: Scope,
        /// Oldest seq still retained.
        min_seq: u64,
    },
}
