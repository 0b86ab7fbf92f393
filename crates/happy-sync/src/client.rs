//! The sync client: entity cache, applier, outbox, RPC, reconnect.
//!
//! Internally one actor task owns all state; the public [`SyncClient`]
//! handle talks to it over a command channel. Frame handling is pure
//! with respect to the socket — handlers return the frames to send —
//! which keeps the concurrency surface small: the actor is the only
//! writer, observers read through events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use happy_core::entities::{EntityRef, MachineStatus, Scope, ScopeKind, SessionLifecycle};
use happy_core::messages::{MessageBody, SessionMessage};
use happy_core::protocol::{ClientFrame, ConnectionKind, RejectReason, RpcFailure, ServerFrame};
use happy_core::retry::REBASE_RETRY_BUDGET;
use happy_core::{now_ms, BackoffConfig, CallId, ConnectionId, LocalId, SessionId};
use happy_crypto::SecretBox;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::CursorStore;
use crate::errors::SyncError;
use crate::socket::{self, AuthedSocket};

/// Async RPC handler: decrypted request in, `Ok(response)` or
/// `Err(error payload)` out.
pub type RpcHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

type PatchFn = Box<dyn FnMut(Option<&Value>) -> Value + Send>;
type MutateReply = oneshot::Sender<Result<u64, SyncError>>;
type MessageReply = oneshot::Sender<Result<u64, SyncError>>;

/// Sync client configuration.
#[derive(Clone)]
pub struct SyncConfig {
    /// Relay base URL (`http://...`).
    pub server_url: String,
    /// Bearer token.
    pub token: String,
    /// Connection kind.
    pub connection_kind: ConnectionKind,
    /// Session or machine id for scoped kinds.
    pub scope_ref: Option<String>,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Outbox capacity; overflow beyond coalescing is backpressure.
    pub outbox_capacity: usize,
    /// Durable cursor file; `None` keeps cursors in memory.
    pub cursor_path: Option<PathBuf>,
    /// Heartbeat send interval.
    pub heartbeat_interval_secs: u64,
}

impl SyncConfig {
    /// Config with defaults for one account token.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            connection_kind: ConnectionKind::UserScoped,
            scope_ref: None,
            backoff: BackoffConfig::default(),
            outbox_capacity: 256,
            cursor_path: None,
            heartbeat_interval_secs: 20,
        }
    }
}

/// Cleartext tags attached to an update.
#[derive(Clone, Copy, Debug, Default)]
pub struct MutateOptions {
    /// Daemon-state tag (machine entities).
    pub machine_status: Option<MachineStatus>,
    /// Lifecycle tag (session entities).
    pub lifecycle: Option<SessionLifecycle>,
}

/// Events observers receive.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// Socket established and authenticated.
    Connected,
    /// Socket lost; the client is reconnecting with backoff.
    Disconnected,
    /// An update was applied to the local cache.
    UpdateApplied {
        /// Target entity.
        entity: EntityRef,
        /// Version after the update.
        version: u64,
        /// Decrypted body, when the update carried one.
        body: Option<Value>,
        /// Cleartext daemon-state tag.
        machine_status: Option<MachineStatus>,
        /// Cleartext lifecycle tag.
        lifecycle: Option<SessionLifecycle>,
    },
    /// A session message arrived.
    MessageReceived {
        /// Source session.
        session_id: SessionId,
        /// Decrypted message.
        message: SessionMessage,
    },
    /// An ephemeral signal arrived. A hint, not state.
    Ephemeral {
        /// Routing scope.
        scope: Scope,
        /// Signal kind.
        kind: String,
        /// Decrypted payload, if any.
        payload: Option<Value>,
        /// Sender clock.
        ts: i64,
    },
    /// The server demanded a snapshot refetch for a scope (in progress
    /// when this event fires).
    ResyncRequired {
        /// Affected scope.
        scope: Scope,
    },
}

enum Command {
    Subscribe {
        scope: Scope,
    },
    Mutate {
        entity: EntityRef,
        opts: MutateOptions,
        patch: PatchFn,
        reply: MutateReply,
    },
    SendMessage {
        session_id: SessionId,
        body: MessageBody,
        reply: MessageReply,
    },
    Ephemeral {
        scope: Scope,
        kind: String,
        payload: Option<Value>,
    },
    Invoke {
        target_scope: Scope,
        method: String,
        request: Value,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, SyncError>>,
    },
    Register {
        scope: Scope,
        method: String,
        handler: RpcHandler,
    },
    Snapshot {
        entity: EntityRef,
        reply: oneshot::Sender<Option<(u64, Option<Value>)>>,
    },
}

struct PendingUpdate {
    entity: EntityRef,
    opts: MutateOptions,
    patch: PatchFn,
    plaintext: Value,
    /// Version the patch was computed against. The publish carries this
    /// as `expectedVersion` — if anything else landed in between, the
    /// server rejects and the patch is re-run on the authoritative body
    /// instead of silently clobbering it.
    basis_version: u64,
    local_id: LocalId,
    attempts: u32,
    in_flight: bool,
    replies: Vec<MutateReply>,
}

struct PendingMessage {
    session_id: SessionId,
    body: MessageBody,
    local_id: LocalId,
    in_flight: bool,
    reply: MessageReply,
}

/// Actor-owned state. Methods are socket-free: they return the frames
/// to send, so the logic is testable without a transport.
struct ClientState {
    crypto: SecretBox,
    events: broadcast::Sender<SyncEvent>,
    cursors: CursorStore,
    outbox_capacity: usize,

    connection_id: Option<ConnectionId>,
    account_id: Option<String>,

    cache: HashMap<EntityRef, (u64, Option<Value>)>,
    subscriptions: HashSet<Scope>,
    update_outbox: VecDeque<PendingUpdate>,
    message_outbox: VecDeque<PendingMessage>,
    handlers: HashMap<(String, String), RpcHandler>,
    pending_invokes: HashMap<CallId, oneshot::Sender<Result<Value, SyncError>>>,
}

impl ClientState {
    fn new(
        crypto: SecretBox,
        events: broadcast::Sender<SyncEvent>,
        cursors: CursorStore,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            crypto,
            events,
            cursors,
            outbox_capacity,
            connection_id: None,
            account_id: None,
            cache: HashMap::new(),
            subscriptions: HashSet::new(),
            update_outbox: VecDeque::new(),
            message_outbox: VecDeque::new(),
            handlers: HashMap::new(),
            pending_invokes: HashMap::new(),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// The cursor key covering an entity: the exact scope when
    /// subscribed to it, otherwise the account scope.
    fn cursor_scope_for(&self, entity: &EntityRef) -> String {
        let exact = entity.scope();
        if self.subscriptions.contains(&exact) {
            return exact.to_string();
        }
        match &self.account_id {
            Some(acct) => Scope::account(acct).to_string(),
            None => exact.to_string(),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Frames to send right after (re)authentication: subscriptions with
    /// cursors, handler registrations, and the outbox flush.
    fn on_connected(&mut self, connection_id: ConnectionId, account_id: String) -> Vec<ClientFrame> {
        self.connection_id = Some(connection_id);
        self.account_id = Some(account_id);
        self.emit(SyncEvent::Connected);

        let mut frames = Vec::new();
        for scope in self.subscriptions.clone() {
            frames.push(self.subscribe_frame(&scope));
        }
        for ((scope_str, method), _) in self.handlers.clone() {
            if let Some(scope) = parse_scope(&scope_str) {
                frames.push(ClientFrame::RpcRegister {
                    scope,
                    method,
                });
            }
        }
        for entry in &mut self.update_outbox {
            entry.in_flight = false;
        }
        for entry in &mut self.message_outbox {
            entry.in_flight = false;
        }
        frames.extend(self.flush());
        frames
    }

    fn on_disconnected(&mut self) {
        self.connection_id = None;
        // In-flight publishes will be retried idempotently.
        for entry in &mut self.update_outbox {
            entry.in_flight = false;
        }
        for entry in &mut self.message_outbox {
            entry.in_flight = false;
        }
        // RPC atop a lossy presence model: in-flight calls die with the
        // socket.
        for (_, reply) in self.pending_invokes.drain() {
            let _ = reply.send(Err(SyncError::Transport));
        }
        self.emit(SyncEvent::Disconnected);
    }

    fn subscribe_frame(&self, scope: &Scope) -> ClientFrame {
        let key = scope.to_string();
        ClientFrame::Subscribe {
            scope: scope.clone(),
            since_seq: Some(self.cursors.update_seq(&key)),
            since_message_seq: if scope.kind == ScopeKind::Session {
                Some(self.cursors.message_seq(&scope.id))
            } else {
                None
            },
        }
    }

    // ── Outbox ──────────────────────────────────────────────────────

    /// Frames for every sendable outbox entry. At most one in-flight
    /// update per entity so expected versions chain correctly.
    fn flush(&mut self) -> Vec<ClientFrame> {
        if self.connection_id.is_none() {
            return Vec::new();
        }
        let mut frames = Vec::new();
        let mut entities_in_flight: HashSet<EntityRef> = self
            .update_outbox
            .iter()
            .filter(|e| e.in_flight)
            .map(|e| e.entity.clone())
            .collect();

        for entry in &mut self.update_outbox {
            if entry.in_flight || entities_in_flight.contains(&entry.entity) {
                continue;
            }
            match self.crypto.seal_json(&entry.plaintext) {
                Ok(body) => {
                    entry.in_flight = true;
                    let _ = entities_in_flight.insert(entry.entity.clone());
                    frames.push(ClientFrame::Update {
                        entity: entry.entity.clone(),
                        expected_version: entry.basis_version,
                        local_id: entry.local_id.clone(),
                        body: Some(body),
                        machine_status: entry.opts.machine_status,
                        lifecycle: entry.opts.lifecycle,
                    });
                }
                Err(e) => warn!(error = %e, "failed to seal update body"),
            }
        }

        for entry in &mut self.message_outbox {
            if entry.in_flight {
                continue;
            }
            match self.crypto.seal_json(&entry.body) {
                Ok(body) => {
                    entry.in_flight = true;
                    frames.push(ClientFrame::Message {
                        session_id: entry.session_id.clone(),
                        local_id: entry.local_id.clone(),
                        body,
                    });
                }
                Err(e) => warn!(error = %e, "failed to seal message body"),
            }
        }
        frames
    }

    /// Optimistically apply a mutation and queue its publish.
    fn enqueue_mutate(
        &mut self,
        entity: EntityRef,
        opts: MutateOptions,
        mut patch: PatchFn,
        reply: MutateReply,
    ) -> Vec<ClientFrame> {
        let (version, current) = self
            .cache
            .get(&entity)
            .map(|(v, b)| (*v, b.clone()))
            .unwrap_or((0, None));
        let plaintext = patch(current.as_ref());

        // Optimistic local overlay; observers see it immediately.
        let _ = self.cache.insert(entity.clone(), (version, Some(plaintext.clone())));
        self.emit(SyncEvent::UpdateApplied {
            entity: entity.clone(),
            version,
            body: Some(plaintext.clone()),
            machine_status: opts.machine_status,
            lifecycle: opts.lifecycle,
        });

        if self.update_outbox.len() >= self.outbox_capacity {
            // Coalesce onto a queued (not yet in-flight) update for the
            // same entity; otherwise it's backpressure.
            if let Some(existing) = self
                .update_outbox
                .iter_mut()
                .find(|e| e.entity == entity && !e.in_flight)
            {
                existing.plaintext = plaintext;
                existing.patch = patch;
                existing.opts = opts;
                existing.replies.push(reply);
                return self.flush();
            }
            let _ = reply.send(Err(SyncError::Backpressure));
            return Vec::new();
        }

        self.update_outbox.push_back(PendingUpdate {
            entity,
            opts,
            patch,
            plaintext,
            basis_version: version,
            local_id: LocalId::new(),
            attempts: 0,
            in_flight: false,
            replies: vec![reply],
        });
        self.flush()
    }

    fn enqueue_message(
        &mut self,
        session_id: SessionId,
        body: MessageBody,
        reply: MessageReply,
    ) -> Vec<ClientFrame> {
        if self.message_outbox.len() >= self.outbox_capacity {
            let _ = reply.send(Err(SyncError::Backpressure));
            return Vec::new();
        }
        self.message_outbox.push_back(PendingMessage {
            session_id,
            body,
            local_id: LocalId::new(),
            in_flight: false,
            reply,
        });
        self.flush()
    }

    // ── Applier ─────────────────────────────────────────────────────

    fn handle_server_frame(&mut self, frame: ServerFrame) -> Vec<ClientFrame> {
        match frame {
            ServerFrame::Update {
                entity,
                version,
                seq,
                producer,
                body,
                machine_status,
                lifecycle,
                ..
            } => {
                self.apply_update(entity, version, seq, producer, body, machine_status, lifecycle)
            }
            ServerFrame::Message {
                session_id,
                message_id,
                seq,
                producer,
                local_id,
                created_at,
                body,
            } => {
                self.apply_message(session_id, message_id, seq, producer, local_id, created_at, body);
                Vec::new()
            }
            ServerFrame::UpdateAck {
                local_id,
                seq,
                new_version,
            } => self.apply_update_ack(&local_id, seq, new_version),
            ServerFrame::UpdateReject {
                local_id,
                reason,
                current_version,
                current_body,
            } => self.apply_update_reject(&local_id, reason, current_version, current_body),
            ServerFrame::MessageAck { local_id, session_id, seq, .. } => {
                if let Some(pos) = self
                    .message_outbox
                    .iter()
                    .position(|e| e.local_id == local_id)
                {
                    let entry = self.message_outbox.remove(pos).expect("position valid");
                    self.cursors.advance_message(session_id.as_str(), seq);
                    let _ = entry.reply.send(Ok(seq));
                }
                Vec::new()
            }
            ServerFrame::Ephemeral {
                scope,
                kind,
                ts,
                payload,
            } => {
                let payload = payload.and_then(|p| self.crypto.open_json(&p).ok());
                self.emit(SyncEvent::Ephemeral {
                    scope,
                    kind,
                    payload,
                    ts,
                });
                Vec::new()
            }
            ServerFrame::RpcResponse {
                call_id,
                ok,
                response,
                error_body,
            } => {
                if let Some(reply) = self.pending_invokes.remove(&call_id) {
                    let result = if ok {
                        match response.map(|r| self.crypto.open_json::<Value>(&r)) {
                            Some(Ok(value)) => Ok(value),
                            Some(Err(e)) => Err(SyncError::Crypto(e)),
                            None => Ok(Value::Null),
                        }
                    } else {
                        Err(SyncError::Handler {
                            body: error_body.and_then(|b| self.crypto.open_json(&b).ok()),
                        })
                    };
                    let _ = reply.send(result);
                }
                Vec::new()
            }
            ServerFrame::RpcError { call_id, reason } => {
                if let Some(reply) = self.pending_invokes.remove(&call_id) {
                    let _ = reply.send(Err(match reason {
                        RpcFailure::NoHandler => SyncError::NoHandler,
                        RpcFailure::Timeout => SyncError::Timeout,
                        RpcFailure::Transport => SyncError::Transport,
                    }));
                }
                Vec::new()
            }
            ServerFrame::Subscribed { scope, since_seq, .. } => {
                debug!(scope = %scope, since_seq, "subscription active");
                Vec::new()
            }
            ServerFrame::ResyncRequired { scope, min_seq } => {
                debug!(scope = %scope, min_seq, "resync required");
                self.emit(SyncEvent::ResyncRequired { scope });
                // The actor performs the HTTP snapshot fetch and
                // resubscribes; nothing to send from here.
                Vec::new()
            }
            ServerFrame::Heartbeat { .. }
            | ServerFrame::AuthOk { .. }
            | ServerFrame::AuthReject { .. } => Vec::new(),
            ServerFrame::RpcCall { .. } => {
                // Handled by the actor (spawns the handler future).
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_update(
        &mut self,
        entity: EntityRef,
        version: u64,
        seq: u64,
        producer: ConnectionId,
        body: Option<String>,
        machine_status: Option<MachineStatus>,
        lifecycle: Option<SessionLifecycle>,
    ) -> Vec<ClientFrame> {
        let scope_key = self.cursor_scope_for(&entity);
        let cursor = self.cursors.update_seq(&scope_key);

        if seq <= cursor {
            return Vec::new(); // duplicate (replay overlap)
        }
        // The account stream carries every update of the account, so its
        // seqs are contiguous: a hole means loss. Re-subscribe from the
        // cursor; the server either replays the gap or demands a resync.
        // Narrower scopes see sparse seqs by construction.
        if cursor > 0 && seq > cursor + 1 && scope_key.starts_with("account:") {
            if let Some(scope) = parse_scope(&scope_key) {
                warn!(scope = %scope, cursor, seq, "gap in update stream, replaying");
                return vec![self.subscribe_frame(&scope)];
            }
        }
        if Some(&producer) == self.connection_id.as_ref() {
            // Self-echo: already applied optimistically; just advance.
            self.cursors.advance_update(&scope_key, seq);
            return Vec::new();
        }

        let decrypted = match body {
            Some(b) => match self.crypto.open_json::<Value>(&b) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(entity = %entity, error = %e, "failed to open update body");
                    None
                }
            },
            None => None,
        };

        let cached_body = match &decrypted {
            Some(v) => Some(v.clone()),
            None => self.cache.get(&entity).and_then(|(_, b)| b.clone()),
        };
        let _ = self.cache.insert(entity.clone(), (version, cached_body));
        self.cursors.advance_update(&scope_key, seq);

        self.emit(SyncEvent::UpdateApplied {
            entity,
            version,
            body: decrypted,
            machine_status,
            lifecycle,
        });
        Vec::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_message(
        &mut self,
        session_id: SessionId,
        message_id: happy_core::MessageId,
        seq: u64,
        producer: ConnectionId,
        local_id: LocalId,
        created_at: i64,
        body: String,
    ) {
        let cursor = self.cursors.message_seq(session_id.as_str());
        if seq <= cursor {
            return;
        }
        if Some(&producer) == self.connection_id.as_ref() {
            self.cursors.advance_message(session_id.as_str(), seq);
            return;
        }
        match self.crypto.open_json::<MessageBody>(&body) {
            Ok(decoded) => {
                self.cursors.advance_message(session_id.as_str(), seq);
                self.emit(SyncEvent::MessageReceived {
                    session_id,
                    message: SessionMessage {
                        id: message_id,
                        local_id,
                        seq,
                        created_at,
                        body: decoded,
                    },
                });
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "failed to open message"),
        }
    }

    fn apply_update_ack(&mut self, local_id: &LocalId, seq: u64, new_version: u64) -> Vec<ClientFrame> {
        let Some(pos) = self
            .update_outbox
            .iter()
            .position(|e| e.local_id == *local_id)
        else {
            return Vec::new();
        };
        let entry = self.update_outbox.remove(pos).expect("position valid");

        // Commit: authoritative version, optimistic body stands.
        let _ = self
            .cache
            .insert(entry.entity.clone(), (new_version, Some(entry.plaintext)));

        let scope_key = self.cursor_scope_for(&entry.entity);
        let cursor = self.cursors.update_seq(&scope_key);
        let mut frames = Vec::new();
        if cursor > 0 && seq > cursor + 1 && scope_key.starts_with("account:") {
            // Our commit landed at `seq` but something before it has not
            // been delivered yet (fan-out and acks race on the socket).
            // Hold the cursor and replay the hole instead of skipping it.
            if let Some(scope) = parse_scope(&scope_key) {
                frames.push(self.subscribe_frame(&scope));
            }
        } else {
            self.cursors.advance_update(&scope_key, seq);
        }

        for reply in entry.replies {
            let _ = reply.send(Ok(new_version));
        }
        // The entity's next queued update may go now.
        frames.extend(self.flush());
        frames
    }

    fn apply_update_reject(
        &mut self,
        local_id: &LocalId,
        reason: RejectReason,
        current_version: Option<u64>,
        current_body: Option<String>,
    ) -> Vec<ClientFrame> {
        let Some(pos) = self
            .update_outbox
            .iter()
            .position(|e| e.local_id == *local_id)
        else {
            return Vec::new();
        };

        match reason {
            RejectReason::VersionMismatch => {
                let mut entry = self.update_outbox.remove(pos).expect("position valid");
                entry.attempts += 1;
                entry.in_flight = false;

                let server_version = current_version.unwrap_or(0);
                let server_body: Option<Value> = current_body
                    .as_deref()
                    .and_then(|b| self.crypto.open_json(b).ok());

                if entry.attempts >= REBASE_RETRY_BUDGET {
                    // Conflict budget spent: adopt the server state and
                    // escalate to the caller.
                    let _ = self
                        .cache
                        .insert(entry.entity.clone(), (server_version, server_body.clone()));
                    self.emit(SyncEvent::UpdateApplied {
                        entity: entry.entity.clone(),
                        version: server_version,
                        body: server_body,
                        machine_status: None,
                        lifecycle: None,
                    });
                    for reply in entry.replies {
                        let _ = reply.send(Err(SyncError::StateConflict {
                            attempts: entry.attempts,
                        }));
                    }
                    return Vec::new();
                }

                // Rebase: re-run the patch on the authoritative body and
                // retry against the authoritative version.
                entry.plaintext = (entry.patch)(server_body.as_ref());
                entry.basis_version = server_version;
                let _ = self
                    .cache
                    .insert(entry.entity.clone(), (server_version, Some(entry.plaintext.clone())));
                self.update_outbox.insert(pos, entry);
                self.flush()
            }
            RejectReason::Auth => {
                let entry = self.update_outbox.remove(pos).expect("position valid");
                for reply in entry.replies {
                    let _ = reply.send(Err(SyncError::Auth {
                        reason: "publish rejected".into(),
                    }));
                }
                Vec::new()
            }
            RejectReason::RateLimit => {
                // Retry on the next flush tick.
                if let Some(entry) = self.update_outbox.get_mut(pos) {
                    entry.in_flight = false;
                }
                Vec::new()
            }
        }
    }
}

fn parse_scope(s: &str) -> Option<Scope> {
    let (kind, id) = s.split_once(':')?;
    match kind {
        "account" => Some(Scope::account(id)),
        "machine" => Some(Scope::machine(id)),
        "session" => Some(Scope::session(id)),
        _ => None,
    }
}

/// Handle to the sync client actor.
pub struct SyncClient {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    connected_rx: watch::Receiver<bool>,
    meta: Arc<Mutex<Option<(ConnectionId, String)>>>,
    shutdown: CancellationToken,
}

impl SyncClient {
    /// Connect and authenticate. Fails fast on bad credentials or an
    /// unreachable relay — callers distinguish those for exit codes and
    /// offline fallback. After this returns, reconnection is internal.
    pub async fn connect(config: SyncConfig, crypto: SecretBox) -> Result<Self, SyncError> {
        let first = socket::connect(
            &config.server_url,
            &config.token,
            config.connection_kind,
            config.scope_ref.as_deref(),
        )
        .await?;

        let (events, _) = broadcast::channel(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (connected_tx, connected_rx) = watch::channel(false);
        let cursors = match &config.cursor_path {
            Some(path) => CursorStore::open(path.clone()),
            None => CursorStore::ephemeral(),
        };
        let state = ClientState::new(crypto, events.clone(), cursors, config.outbox_capacity);
        let meta = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let actor = Actor {
            config,
            state,
            cmd_rx,
            connected_tx,
            meta: meta.clone(),
            shutdown: shutdown.clone(),
        };
        let _ = tokio::spawn(actor.run(Some(first)));

        Ok(Self {
            cmd_tx,
            events,
            connected_rx,
            meta,
            shutdown,
        })
    }

    /// Subscribe to a scope; events for it flow to [`Self::events`].
    pub async fn subscribe(&self, scope: Scope) -> Result<(), SyncError> {
        self.cmd_tx
            .send(Command::Subscribe { scope })
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Mutate an entity: read-modify-write with optimistic concurrency
    /// and bounded rebase-and-retry. Resolves to the committed version.
    pub async fn mutate<F>(
        &self,
        entity: EntityRef,
        opts: MutateOptions,
        patch: F,
    ) -> Result<u64, SyncError>
    where
        F: FnMut(Option<&Value>) -> Value + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Mutate {
                entity,
                opts,
                patch: Box::new(patch),
                reply,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Append a message to a session log. Resolves to the assigned seq.
    pub async fn send_message(
        &self,
        session_id: SessionId,
        body: MessageBody,
    ) -> Result<u64, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendMessage {
                session_id,
                body,
                reply,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Fire-and-forget ephemeral signal.
    pub async fn emit_ephemeral(
        &self,
        scope: Scope,
        kind: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), SyncError> {
        self.cmd_tx
            .send(Command::Ephemeral {
                scope,
                kind: kind.into(),
                payload,
            })
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Call an RPC on whichever connection serves `(scope, method)`.
    pub async fn invoke(
        &self,
        target_scope: Scope,
        method: impl Into<String>,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Invoke {
                target_scope,
                method: method.into(),
                request,
                timeout,
                reply,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        // Local backstop: the server synthesizes `timeout` on its own,
        // but a dead server must not hang the caller.
        match tokio::time::timeout(timeout + Duration::from_secs(2), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Register a handler for `(scope, method)`; survives reconnects.
    pub async fn register<F>(
        &self,
        scope: Scope,
        method: impl Into<String>,
        handler: F,
    ) -> Result<(), SyncError>
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync + 'static,
    {
        self.cmd_tx
            .send(Command::Register {
                scope,
                method: method.into(),
                handler: Arc::new(handler),
            })
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Current cached state of an entity.
    pub async fn entity(&self, entity: EntityRef) -> Option<(u64, Option<Value>)> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { entity, reply })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Event stream (updates, messages, connectivity, ephemerals).
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Connectivity observable.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// The server-assigned connection id, once authenticated.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.meta.lock().as_ref().map(|(c, _)| c.clone())
    }

    /// The resolved account id, once authenticated.
    pub fn account_id(&self) -> Option<String> {
        self.meta.lock().as_ref().map(|(_, a)| a.clone())
    }

    /// Stop the actor and drop the socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Actor {
    config: SyncConfig,
    state: ClientState,
    cmd_rx: mpsc::Receiver<Command>,
    connected_tx: watch::Sender<bool>,
    meta: Arc<Mutex<Option<(ConnectionId, String)>>>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut first: Option<AuthedSocket>) {
        let http = reqwest::Client::new();
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let socket = match first.take() {
                Some(s) => s,
                None => {
                    match socket::connect(
                        &self.config.server_url,
                        &self.config.token,
                        self.config.connection_kind,
                        self.config.scope_ref.as_deref(),
                    )
                    .await
                    {
                        Ok(s) => s,
                        Err(SyncError::Auth { reason }) => {
                            // Terminal: a rotated/revoked credential will
                            // not fix itself by retrying.
                            warn!(reason, "authentication failed, stopping sync client");
                            return;
                        }
                        Err(_) => {
                            // Backoff, but keep accepting commands: offline
                            // mutations land in the outbox and flush on
                            // reconnect.
                            let delay = self.config.backoff.delay_for_attempt(attempt);
                            attempt = attempt.saturating_add(1);
                            let deadline = tokio::time::Instant::now() + delay;
                            loop {
                                tokio::select! {
                                    () = tokio::time::sleep_until(deadline) => break,
                                    () = self.shutdown.cancelled() => return,
                                    cmd = self.cmd_rx.recv() => {
                                        let Some(cmd) = cmd else { return };
                                        // Not connected: frames are dropped;
                                        // durable work waits in the outbox.
                                        let _ = self.handle_command(cmd);
                                    }
                                }
                            }
                            continue;
                        }
                    }
                }
            };
            attempt = 0;

            let AuthedSocket {
                mut sink,
                mut source,
                connection_id,
                account_id,
            } = socket;
            *self.meta.lock() = Some((connection_id.clone(), account_id.to_string()));
            let _ = self.connected_tx.send(true);
            info!(connection_id = %connection_id, "sync client connected");

            let hello = self
                .state
                .on_connected(connection_id, account_id.to_string());
            if send_all(&mut sink, hello).await.is_err() {
                self.disconnect();
                continue;
            }

            // Frames produced by spawned RPC handler tasks.
            let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
            let mut heartbeat =
                tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
            heartbeat.tick().await; // immediate first tick

            let lost = loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    _ = heartbeat.tick() => {
                        let frame = ClientFrame::Heartbeat { ts: now_ms() };
                        if socket::send_frame(&mut sink, &frame).await.is_err() {
                            break true;
                        }
                        // Flush tick doubles as the rate-limit retry.
                        let frames = self.state.flush();
                        if send_all(&mut sink, frames).await.is_err() {
                            break true;
                        }
                    }
                    Some(frame) = out_rx.recv() => {
                        if socket::send_frame(&mut sink, &frame).await.is_err() {
                            break true;
                        }
                    }
                    cmd = self.cmd_rx.recv() => {
                        let Some(cmd) = cmd else { return };
                        let frames = self.handle_command(cmd);
                        if send_all(&mut sink, frames).await.is_err() {
                            break true;
                        }
                    }
                    incoming = source.next() => {
                        let Some(Ok(msg)) = incoming else { break true };
                        let text = match msg {
                            WsMessage::Text(t) => t.to_string(),
                            WsMessage::Close(_) => break true,
                            _ => continue,
                        };
                        let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) else {
                            warn!("malformed server frame, reconnecting");
                            break true;
                        };

                        match frame {
                            ServerFrame::RpcCall { call_id, target_scope, method, request, .. } => {
                                self.spawn_handler(call_id, target_scope, method, request, out_tx.clone());
                            }
                            ServerFrame::ResyncRequired { scope, min_seq } => {
                                let _ = self.state.handle_server_frame(ServerFrame::ResyncRequired {
                                    scope: scope.clone(),
                                    min_seq,
                                });
                                let frames = self.resync(&http, &scope).await;
                                if send_all(&mut sink, frames).await.is_err() {
                                    break true;
                                }
                            }
                            other => {
                                let frames = self.state.handle_server_frame(other);
                                if send_all(&mut sink, frames).await.is_err() {
                                    break true;
                                }
                            }
                        }
                    }
                }
            };

            if lost {
                self.disconnect();
            }
        }
    }

    fn disconnect(&mut self) {
        let _ = self.connected_tx.send(false);
        *self.meta.lock() = None;
        self.state.on_disconnected();
    }

    fn handle_command(&mut self, cmd: Command) -> Vec<ClientFrame> {
        match cmd {
            Command::Subscribe { scope } => {
                let _ = self.state.subscriptions.insert(scope.clone());
                vec![self.state.subscribe_frame(&scope)]
            }
            Command::Mutate {
                entity,
                opts,
                patch,
                reply,
            } => self.state.enqueue_mutate(entity, opts, patch, reply),
            Command::SendMessage {
                session_id,
                body,
                reply,
            } => self.state.enqueue_message(session_id, body, reply),
            Command::Ephemeral {
                scope,
                kind,
                payload,
            } => {
                let payload = payload.and_then(|p| self.state.crypto.seal_json(&p).ok());
                vec![ClientFrame::Ephemeral {
                    scope,
                    kind,
                    ts: now_ms(),
                    payload,
                }]
            }
            Command::Invoke {
                target_scope,
                method,
                request,
                timeout,
                reply,
            } => {
                if self.state.connection_id.is_none() {
                    let _ = reply.send(Err(SyncError::Transport));
                    return Vec::new();
                }
                match self.state.crypto.seal_json(&request) {
                    Ok(sealed) => {
                        let call_id = CallId::new();
                        let _ = self.state.pending_invokes.insert(call_id.clone(), reply);
                        vec![ClientFrame::RpcCall {
                            call_id,
                            target_scope,
                            method,
                            timeout_ms: timeout.as_millis() as u64,
                            request: sealed,
                        }]
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SyncError::Crypto(e)));
                        Vec::new()
                    }
                }
            }
            Command::Register {
                scope,
                method,
                handler,
            } => {
                let _ = self
                    .state
                    .handlers
                    .insert((scope.to_string(), method.clone()), handler);
                vec![ClientFrame::RpcRegister { scope, method }]
            }
            Command::Snapshot { entity, reply } => {
                let snapshot = self.state.cache.get(&entity).cloned();
                let _ = reply.send(snapshot);
                Vec::new()
            }
        }
    }

    fn spawn_handler(
        &self,
        call_id: CallId,
        target_scope: Scope,
        method: String,
        request: String,
        out_tx: mpsc::Sender<ClientFrame>,
    ) {
        let key = (target_scope.to_string(), method);
        let Some(handler) = self.state.handlers.get(&key).cloned() else {
            let frame = ClientFrame::RpcResponse {
                call_id,
                ok: false,
                response: None,
                error_body: None,
            };
            let _ = out_tx.try_send(frame);
            return;
        };
        let crypto = self.state.crypto.clone();
        let _ = tokio::spawn(async move {
            let decoded = match crypto.open_json::<Value>(&request) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to open rpc request");
                    let _ = out_tx
                        .send(ClientFrame::RpcResponse {
                            call_id,
                            ok: false,
                            response: None,
                            error_body: None,
                        })
                        .await;
                    return;
                }
            };
            let frame = match handler(decoded).await {
                Ok(result) => ClientFrame::RpcResponse {
                    call_id,
                    ok: true,
                    response: crypto.seal_json(&result).ok(),
                    error_body: None,
                },
                Err(err) => ClientFrame::RpcResponse {
                    call_id,
                    ok: false,
                    response: None,
                    error_body: crypto.seal_json(&err).ok(),
                },
            };
            let _ = out_tx.send(frame).await;
        });
    }

    /// Full resync of a scope: snapshot over HTTP, adopt heads, reset
    /// the cursor to the snapshot floor, resubscribe.
    async fn resync(&mut self, http: &reqwest::Client, scope: &Scope) -> Vec<ClientFrame> {
        let url = format!("{}/v1/account", self.config.server_url.trim_end_matches('/'));
        let snapshot: Value = match http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(resp) => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "snapshot decode failed");
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!(error = %e, "snapshot fetch failed");
                return Vec::new();
            }
        };

        let floor = snapshot["seq"].as_u64().unwrap_or(0);
        self.adopt_heads(&snapshot);
        self.state.cursors.reset_update(&scope.to_string(), floor);
        vec![self.state.subscribe_frame(scope)]
    }

    fn adopt_heads(&mut self, snapshot: &Value) {
        let mut adopt = |entity: EntityRef, row: &Value| {
            let version = row["version"].as_u64().unwrap_or(0);
            let body = row["headBody"]
                .as_str()
                .and_then(|b| self.state.crypto.open_json::<Value>(b).ok());
            let _ = self.state.cache.insert(entity.clone(), (version, body.clone()));
            self.state.emit(SyncEvent::UpdateApplied {
                entity,
                version,
                body,
                machine_status: None,
                lifecycle: None,
            });
        };

        if let Some(sessions) = snapshot["sessions"].as_array() {
            for row in sessions {
                if let Some(id) = row["id"].as_str() {
                    adopt(EntityRef::session(id), row);
                }
            }
        }
        if let Some(machines) = snapshot["machines"].as_array() {
            for row in machines {
                if let Some(id) = row["id"].as_str() {
                    adopt(EntityRef::machine(id), row);
                }
            }
        }
    }
}

async fn send_all(
    sink: &mut crate::socket::WsSink,
    frames: Vec<ClientFrame>,
) -> Result<(), SyncError> {
    for frame in frames {
        socket::send_frame(sink, &frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use happy_crypto::MasterSecret;
    use serde_json::json;

    fn make_state() -> (ClientState, broadcast::Receiver<SyncEvent>) {
        let secret = MasterSecret::random();
        let crypto = SecretBox::new(&secret.derive_content_key("acct"));
        let (events, rx) = broadcast::channel(64);
        let mut state = ClientState::new(crypto, events, CursorStore::ephemeral(), 4);
        state.connection_id = Some(ConnectionId::from("self"));
        state.account_id = Some("acct".into());
        let _ = state.subscriptions.insert(Scope::account("acct"));
        (state, rx)
    }

    fn seal(state: &ClientState, value: &Value) -> String {
        state.crypto.seal_json(value).unwrap()
    }

    fn mutate_reply() -> (MutateReply, oneshot::Receiver<Result<u64, SyncError>>) {
        oneshot::channel()
    }

    #[test]
    fn mutate_applies_optimistically_and_emits_update_frame() {
        let (mut state, mut rx) = make_state();
        let (reply, _reply_rx) = mutate_reply();

        let frames = state.enqueue_mutate(
            EntityRef::session("s-1"),
            MutateOptions::default(),
            Box::new(|_| json!({"title": "hello"})),
            reply,
        );

        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ClientFrame::Update {
                entity,
                expected_version,
                body,
                ..
            } => {
                assert_eq!(*entity, EntityRef::session("s-1"));
                assert_eq!(*expected_version, 0);
                assert!(body.is_some());
            }
            other => panic!("expected update frame, got {other:?}"),
        }

        // Optimistic overlay visible immediately
        let (version, body) = state.cache.get(&EntityRef::session("s-1")).unwrap();
        assert_eq!(*version, 0);
        assert_eq!(body.as_ref().unwrap()["title"], "hello");
        assert!(matches!(rx.try_recv(), Ok(SyncEvent::UpdateApplied { .. })));
    }

    #[test]
    fn ack_commits_version_and_resolves_caller() {
        let (mut state, _rx) = make_state();
        let (reply, mut reply_rx) = mutate_reply();
        let frames = state.enqueue_mutate(
            EntityRef::session("s-1"),
            MutateOptions::default(),
            Box::new(|_| json!({"n": 1})),
            reply,
        );
        let ClientFrame::Update { local_id, .. } = &frames[0] else {
            panic!("expected update frame");
        };

        let follow_up = state.apply_update_ack(local_id, 7, 1);
        assert!(follow_up.is_empty());
        assert_eq!(state.cache.get(&EntityRef::session("s-1")).unwrap().0, 1);
        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), 1);
        // Ack advances the account cursor so replay after reconnect
        // doesn't start from zero.
        assert_eq!(state.cursors.update_seq("account:acct"), 7);
    }

    #[test]
    fn version_mismatch_rebases_and_retries() {
        let (mut state, _rx) = make_state();
        let (reply, mut reply_rx) = mutate_reply();
        // Patch that appends to whatever is there
        let frames = state.enqueue_mutate(
            EntityRef::session("s-1"),
            MutateOptions::default(),
            Box::new(|current| {
                let base = current
                    .and_then(|v| v["log"].as_str())
                    .unwrap_or("")
                    .to_owned();
                json!({"log": format!("{base}+mine")})
            }),
            reply,
        );
        let ClientFrame::Update { local_id, .. } = &frames[0] else {
            panic!("expected update frame");
        };
        let local_id = local_id.clone();

        let server_body = seal(&state, &json!({"log": "theirs"}));
        let retry = state.apply_update_reject(
            &local_id,
            RejectReason::VersionMismatch,
            Some(3),
            Some(server_body),
        );

        assert_eq!(retry.len(), 1);
        match &retry[0] {
            ClientFrame::Update {
                expected_version,
                local_id: retry_id,
                ..
            } => {
                assert_eq!(*expected_version, 3, "rebased onto authoritative version");
                assert_eq!(*retry_id, local_id, "same logical mutation");
            }
            other => panic!("expected retry, got {other:?}"),
        }
        // Rebase re-ran the patch on the server body
        let (_, body) = state.cache.get(&EntityRef::session("s-1")).unwrap();
        assert_eq!(body.as_ref().unwrap()["log"], "theirs+mine");
        assert!(reply_rx.try_recv().is_err(), "not resolved until commit");
    }

    #[test]
    fn rebase_budget_exhaustion_escalates() {
        let (mut state, _rx) = make_state();
        let (reply, mut reply_rx) = mutate_reply();
        let frames = state.enqueue_mutate(
            EntityRef::session("s-1"),
            MutateOptions::default(),
            Box::new(|_| json!({"v": "mine"})),
            reply,
        );
        let ClientFrame::Update { local_id, .. } = &frames[0] else {
            panic!("expected update frame");
        };
        let local_id = local_id.clone();

        for attempt in 1..=REBASE_RETRY_BUDGET {
            let server_body = seal(&state, &json!({"v": "theirs"}));
            let retry = state.apply_update_reject(
                &local_id,
                RejectReason::VersionMismatch,
                Some(attempt as u64),
                Some(server_body),
            );
            if attempt < REBASE_RETRY_BUDGET {
                assert_eq!(retry.len(), 1, "attempt {attempt} should retry");
            } else {
                assert!(retry.is_empty(), "budget exhausted, no retry");
            }
        }

        match reply_rx.try_recv().unwrap() {
            Err(SyncError::StateConflict { attempts }) => {
                assert_eq!(attempts, REBASE_RETRY_BUDGET);
            }
            other => panic!("expected state conflict, got {other:?}"),
        }
        // Cache adopted the authoritative state
        let (version, body) = state.cache.get(&EntityRef::session("s-1")).unwrap();
        assert_eq!(*version, REBASE_RETRY_BUDGET as u64);
        assert_eq!(body.as_ref().unwrap()["v"], "theirs");
    }

    #[test]
    fn self_echo_advances_cursor_without_event() {
        let (mut state, mut rx) = make_state();
        let body = seal(&state, &json!({"x": 1}));
        let frames = state.handle_server_frame(ServerFrame::Update {
            entity: EntityRef::session("s-1"),
            version: 1,
            seq: 5,
            producer: ConnectionId::from("self"),
            local_id: LocalId::from("l-1"),
            body: Some(body),
            machine_status: None,
            lifecycle: None,
        });
        assert!(frames.is_empty());
        assert_eq!(state.cursors.update_seq("account:acct"), 5);
        assert!(rx.try_recv().is_err(), "no event for own update");
    }

    #[test]
    fn foreign_update_applies_and_notifies() {
        let (mut state, mut rx) = make_state();
        let body = seal(&state, &json!({"x": 2}));
        let _ = state.handle_server_frame(ServerFrame::Update {
            entity: EntityRef::session("s-1"),
            version: 4,
            seq: 9,
            producer: ConnectionId::from("other"),
            local_id: LocalId::from("l-2"),
            body: Some(body),
            machine_status: None,
            lifecycle: None,
        });
        let (version, cached) = state.cache.get(&EntityRef::session("s-1")).unwrap();
        assert_eq!(*version, 4);
        assert_eq!(cached.as_ref().unwrap()["x"], 2);
        match rx.try_recv().unwrap() {
            SyncEvent::UpdateApplied { version, body, .. } => {
                assert_eq!(version, 4);
                assert_eq!(body.unwrap()["x"], 2);
            }
            other => panic!("expected update event, got {other:?}"),
        }
    }

    #[test]
    fn gap_in_account_stream_triggers_replay() {
        let (mut state, _rx) = make_state();
        let make = |seq: u64| ServerFrame::Update {
            entity: EntityRef::session("s-1"),
            version: seq,
            seq,
            producer: ConnectionId::from("other"),
            local_id: LocalId::from(format!("l{seq}").as_str()),
            body: None,
            machine_status: None,
            lifecycle: None,
        };
        assert!(state.handle_server_frame(make(1)).is_empty());
        // seq 2 lost; 3 arrives
        let frames = state.handle_server_frame(make(3));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ClientFrame::Subscribe { scope, since_seq, .. } => {
                assert_eq!(*scope, Scope::account("acct"));
                assert_eq!(*since_seq, Some(1), "replay resumes from the cursor");
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
        // The out-of-order update was not applied
        assert_eq!(state.cursors.update_seq("account:acct"), 1);
    }

    #[test]
    fn duplicate_seq_is_skipped() {
        let (mut state, mut rx) = make_state();
        let body = seal(&state, &json!({"x": 1}));
        let frame = ServerFrame::Update {
            entity: EntityRef::session("s-1"),
            version: 1,
            seq: 5,
            producer: ConnectionId::from("other"),
            local_id: LocalId::from("l"),
            body: Some(body),
            machine_status: None,
            lifecycle: None,
        };
        let _ = state.handle_server_frame(frame.clone());
        let _ = rx.try_recv().unwrap();
        let _ = state.handle_server_frame(frame);
        assert!(rx.try_recv().is_err(), "replayed duplicate produces no event");
    }

    #[test]
    fn backpressure_when_outbox_full_of_distinct_entities() {
        let (mut state, _rx) = make_state();
        for i in 0..4 {
            let (reply, _r) = mutate_reply();
            let _ = state.enqueue_mutate(
                EntityRef::session(format!("s-{i}")),
                MutateOptions::default(),
                Box::new(|_| json!({})),
                reply,
            );
        }
        let (reply, mut reply_rx) = mutate_reply();
        let _ = state.enqueue_mutate(
            EntityRef::session("s-new"),
            MutateOptions::default(),
            Box::new(|_| json!({})),
            reply,
        );
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(SyncError::Backpressure)
        ));
    }

    #[test]
    fn overflow_coalesces_onto_same_entity() {
        let (mut state, _rx) = make_state();
        // Fill: first goes in-flight, rest queued.
        for i in 0..4 {
            let (reply, _r) = mutate_reply();
            let _ = state.enqueue_mutate(
                EntityRef::session(format!("s-{i}")),
                MutateOptions::default(),
                Box::new(move |_| json!({"n": i})),
                reply,
            );
        }
        // s-3 is queued but not in flight (s-0..3 flushed individually;
        // all distinct entities flush immediately). Re-mutating s-3 at
        // capacity must coalesce, not fail.
        let (reply, mut reply_rx) = mutate_reply();
        let _ = state.enqueue_mutate(
            EntityRef::session("s-3"),
            MutateOptions::default(),
            Box::new(|_| json!({"n": 99})),
            reply,
        );
        // All entries were flushed (in_flight), so coalescing has no
        // target and this is backpressure.
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(SyncError::Backpressure)
        ));

        // Now with a queued (not in-flight) entry: disconnect resets
        // in_flight, making coalescing possible.
        state.on_disconnected();
        let (reply2, mut reply2_rx) = mutate_reply();
        let _ = state.enqueue_mutate(
            EntityRef::session("s-2"),
            MutateOptions::default(),
            Box::new(|_| json!({"n": 42})),
            reply2,
        );
        assert!(reply2_rx.try_recv().is_err(), "coalesced, resolves on commit");
        let coalesced = state
            .update_outbox
            .iter()
            .find(|e| e.entity == EntityRef::session("s-2"))
            .unwrap();
        assert_eq!(coalesced.plaintext["n"], 42);
        assert_eq!(coalesced.replies.len(), 2);
    }

    #[test]
    fn message_ack_resolves_and_advances_cursor() {
        let (mut state, _rx) = make_state();
        let (reply, mut reply_rx) = oneshot::channel();
        let frames = state.enqueue_message(
            SessionId::from("s-1"),
            MessageBody::UserText { text: "hi".into() },
            reply,
        );
        let ClientFrame::Message { local_id, .. } = &frames[0] else {
            panic!("expected message frame");
        };

        let _ = state.handle_server_frame(ServerFrame::MessageAck {
            local_id: local_id.clone(),
            session_id: SessionId::from("s-1"),
            message_id: happy_core::MessageId::from("m-1"),
            seq: 3,
        });
        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), 3);
        assert_eq!(state.cursors.message_seq("s-1"), 3);
    }

    #[test]
    fn incoming_message_decrypts_and_notifies() {
        let (mut state, mut rx) = make_state();
        let body = state
            .crypto
            .seal_json(&MessageBody::AgentText { text: "ok".into() })
            .unwrap();
        let _ = state.handle_server_frame(ServerFrame::Message {
            session_id: SessionId::from("s-1"),
            message_id: happy_core::MessageId::from("m-9"),
            seq: 1,
            producer: ConnectionId::from("other"),
            local_id: LocalId::from("l-9"),
            created_at: 100,
            body,
        });
        match rx.try_recv().unwrap() {
            SyncEvent::MessageReceived { message, .. } => {
                assert_eq!(message.seq, 1);
                assert_eq!(message.body, MessageBody::AgentText { text: "ok".into() });
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[test]
    fn rpc_error_reasons_map_to_sync_errors() {
        let (mut state, _rx) = make_state();
        for (reason, check) in [
            (RpcFailure::NoHandler, "no handler"),
            (RpcFailure::Timeout, "timeout"),
            (RpcFailure::Transport, "transport"),
        ] {
            let (reply, mut reply_rx) = oneshot::channel();
            let call_id = CallId::new();
            let _ = state.pending_invokes.insert(call_id.clone(), reply);
            let _ = state.handle_server_frame(ServerFrame::RpcError { call_id, reason });
            let err = reply_rx.try_recv().unwrap().unwrap_err();
            match reason {
                RpcFailure::NoHandler => assert!(matches!(err, SyncError::NoHandler), "{check}"),
                RpcFailure::Timeout => assert!(matches!(err, SyncError::Timeout), "{check}"),
                RpcFailure::Transport => assert!(matches!(err, SyncError::Transport), "{check}"),
            }
        }
    }

    #[test]
    fn disconnect_fails_inflight_invokes() {
        let (mut state, _rx) = make_state();
        let (reply, mut reply_rx) = oneshot::channel();
        let _ = state.pending_invokes.insert(CallId::new(), reply);
        state.on_disconnected();
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(SyncError::Transport)
        ));
    }

    #[test]
    fn reconnect_replays_subscriptions_and_outbox() {
        let (mut state, _rx) = make_state();
        let (reply, _r) = mutate_reply();
        let _ = state.enqueue_mutate(
            EntityRef::session("s-1"),
            MutateOptions::default(),
            Box::new(|_| json!({"a": 1})),
            reply,
        );
        state.on_disconnected();

        let frames = state.on_connected(ConnectionId::from("self-2"), "acct".into());
        let has_subscribe = frames
            .iter()
            .any(|f| matches!(f, ClientFrame::Subscribe { .. }));
        let has_update = frames
            .iter()
            .any(|f| matches!(f, ClientFrame::Update { .. }));
        assert!(has_subscribe, "resubscribes scopes with cursors");
        assert!(has_update, "flushes the outbox idempotently");
    }

    #[test]
    fn parse_scope_roundtrip() {
        assert_eq!(parse_scope("session:s-1"), Some(Scope::session("s-1")));
        assert_eq!(parse_scope("account:a"), Some(Scope::account("a")));
        assert_eq!(parse_scope("machine:m"), Some(Scope::machine("m")));
        assert_eq!(parse_scope("bogus"), None);
    }
}
