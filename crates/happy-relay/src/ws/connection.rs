//! Per-socket connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use happy_core::entities::Scope;
use happy_core::protocol::ServerFrame;
use happy_core::ConnectionId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Represents one authenticated WebSocket client.
pub struct ClientConnection {
    /// Server-assigned connection id (self-echo suppression key).
    pub id: ConnectionId,
    /// Owning account.
    pub account_id: String,
    /// The scope this connection was admitted for (from its connection
    /// kind). Governs ephemeral and RPC routing from the moment of auth.
    pub auto_scope: Scope,
    /// Scopes with an active update/message stream. Populated by explicit
    /// `subscribe` frames — that is where the client supplies its cursor,
    /// so delivery is gap-free from the cursor onward.
    subscriptions: Mutex<HashSet<Scope>>,
    /// Send channel to the socket's write task. Frames are pre-serialized
    /// once and shared across subscribers.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelling this token tears the socket down (used when the
    /// outbound buffer overflows).
    pub cancel: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded since the last heartbeat tick.
    pub is_alive: AtomicBool,
    /// When the last heartbeat (or any activity) was received.
    last_seen: Mutex<Instant>,
    /// Count of frames dropped due to a full channel.
    pub dropped_frames: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection with its auto-subscription.
    pub fn new(
        id: ConnectionId,
        account_id: String,
        auto_scope: Scope,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            account_id,
            auto_scope,
            subscriptions: Mutex::new(HashSet::new()),
            tx,
            cancel: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Add a scope to this connection's subscription set.
    pub fn subscribe(&self, scope: Scope) {
        let _ = self.subscriptions.lock().insert(scope);
    }

    /// Whether this connection has an active update/message stream for
    /// `scope`.
    ///
    /// A subscription to the account scope covers every scope of that
    /// account; otherwise the scope must match exactly. Cross-account
    /// traffic never reaches this check — the hub routes per account.
    pub fn wants(&self, scope: &Scope) -> bool {
        let subs = self.subscriptions.lock();
        if subs.contains(scope) {
            return true;
        }
        subs.contains(&Scope::account(&self.account_id))
    }

    /// Whether this connection should receive ephemeral events for
    /// `scope`. The auto scope counts from the moment of auth.
    pub fn wants_ephemeral(&self, scope: &Scope) -> bool {
        if self.auto_scope == *scope || self.auto_scope == Scope::account(&self.account_id) {
            return true;
        }
        self.wants(scope)
    }

    /// Enqueue a pre-serialized frame.
    ///
    /// Returns `false` if the channel is full or closed; the caller
    /// decides whether that means disconnect (fan-out) or retry (direct
    /// responses).
    pub fn send_raw(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and enqueue a frame.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send_raw(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Tear the connection down (e.g. slow-subscriber overflow).
    pub fn kick(&self) {
        self.cancel.cancel();
    }

    /// Mark the connection as alive (heartbeat or any frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Duration since the last sign of life.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Check and reset the alive flag for the heartbeat loop.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}
