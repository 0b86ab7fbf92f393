//! Scope-routed fan-out to connected clients.
//!
//! The hub keeps an account-keyed routing table of live connections.
//! Frames are serialized once per fan-out and shared as `Arc<String>`
//! across recipients. A subscriber whose outbound buffer overflows is
//! kicked — it will reconnect and resync (the update log makes that
//! lossless).

use std::collections::HashMap;
use std::sync::Arc;

use happy_core::entities::Scope;
use happy_core::protocol::ServerFrame;
use happy_core::ConnectionId;
use happy_store::{MessageRow, UpdateRow};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::metrics::{FANOUT_FRAMES_TOTAL, FANOUT_KICKS_TOTAL};

use super::connection::ClientConnection;

/// Account-keyed connection routing table.
pub struct Hub {
    /// account id → (connection id → connection).
    accounts: RwLock<HashMap<String, HashMap<ConnectionId, Arc<ClientConnection>>>>,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a connection into its account's routing table.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut accounts = self.accounts.write().await;
        let _ = accounts
            .entry(connection.account_id.clone())
            .or_default()
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection; drops the account entry when it empties.
    pub async fn remove(&self, account_id: &str, connection_id: &ConnectionId) {
        let mut accounts = self.accounts.write().await;
        if let Some(conns) = accounts.get_mut(account_id) {
            let _ = conns.remove(connection_id);
            if conns.is_empty() {
                let _ = accounts.remove(account_id);
            }
        }
    }

    /// Total live connections.
    pub async fn connection_count(&self) -> usize {
        self.accounts.read().await.values().map(HashMap::len).sum()
    }

    /// Live connections for one account.
    pub async fn account_connection_count(&self, account_id: &str) -> usize {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map_or(0, HashMap::len)
    }

    /// Fan a persisted update out to every subscriber of its scope,
    /// excluding the publisher connection (self-echo suppression).
    pub async fn fan_out_update(&self, update: &UpdateRow, exclude: Option<&ConnectionId>) {
        let scope = update.entity_ref().scope();
        let frame = update_frame(update);
        self.fan_out(&update.account_id, &scope, &frame, exclude, "update")
            .await;
    }

    /// Fan a session message out to its session's subscribers, excluding
    /// the appender.
    pub async fn fan_out_message(&self, message: &MessageRow, exclude: Option<&ConnectionId>) {
        let scope = Scope::session(&message.session_id);
        let frame = message_frame(message);
        self.fan_out(&message.account_id, &scope, &frame, exclude, "message")
            .await;
    }

    /// Best-effort broadcast of an ephemeral event. Loss is not an error.
    /// Routing uses the ephemeral membership rule (auto scope counts from
    /// the moment of auth).
    pub async fn fan_out_ephemeral(
        &self,
        account_id: &str,
        scope: &Scope,
        frame: &ServerFrame,
        exclude: Option<&ConnectionId>,
    ) {
        let json = match serde_json::to_string(frame) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(error = %e, "failed to serialize ephemeral frame");
                return;
            }
        };
        let accounts = self.accounts.read().await;
        let Some(conns) = accounts.get(account_id) else {
            return;
        };
        let mut recipients = 0usize;
        for conn in conns.values() {
            if Some(&conn.id) == exclude || !conn.wants_ephemeral(scope) {
                continue;
            }
            recipients += 1;
            // Loss is fine; nobody is kicked over a dropped hint.
            let _ = conn.send_raw(json.clone());
        }
        counter!(FANOUT_FRAMES_TOTAL, "kind" => "ephemeral").increment(recipients as u64);
    }

    /// Activate an update/message subscription and replay history
    /// atomically with respect to fan-out.
    ///
    /// The write lock excludes concurrent fan-outs for the whole hub, so
    /// the replay frames enter the connection's outbound queue strictly
    /// before any live update published after the snapshot — the client
    /// sees a gap-free, ordered stream from its cursor.
    pub async fn subscribe_and_replay(
        &self,
        conn: &Arc<ClientConnection>,
        scope: Scope,
        replay: Vec<ServerFrame>,
    ) {
        let _guard = self.accounts.write().await;
        for frame in &replay {
            if let Ok(json) = serde_json::to_string(frame) {
                if !conn.send_raw(Arc::new(json)) {
                    counter!(FANOUT_KICKS_TOTAL).increment(1);
                    conn.kick();
                    return;
                }
            }
        }
        conn.subscribe(scope);
    }

    /// Serialize once, deliver to every interested connection of the
    /// account. Subscribers that cannot keep up are kicked.
    async fn fan_out(
        &self,
        account_id: &str,
        scope: &Scope,
        frame: &ServerFrame,
        exclude: Option<&ConnectionId>,
        kind: &'static str,
    ) {
        let json = match serde_json::to_string(frame) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(kind, error = %e, "failed to serialize fan-out frame");
                return;
            }
        };

        let accounts = self.accounts.read().await;
        let Some(conns) = accounts.get(account_id) else {
            return;
        };

        let mut recipients = 0usize;
        for conn in conns.values() {
            if Some(&conn.id) == exclude || !conn.wants(scope) {
                continue;
            }
            recipients += 1;
            if !conn.send_raw(json.clone()) {
                counter!(FANOUT_KICKS_TOTAL).increment(1);
                warn!(
                    conn_id = %conn.id,
                    dropped = conn.drop_count(),
                    "subscriber overflowed outbound buffer, kicking"
                );
                conn.kick();
            }
        }
        counter!(FANOUT_FRAMES_TOTAL, "kind" => kind).increment(recipients as u64);
        debug!(kind, scope = %scope, recipients, "fan-out");
    }

    /// Direct lookup (RPC forwarding targets a single connection).
    pub async fn get(
        &self,
        account_id: &str,
        connection_id: &ConnectionId,
    ) -> Option<Arc<ClientConnection>> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .and_then(|conns| conns.get(connection_id))
            .cloned()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire frame for a stored update (used for fan-out and replay alike).
pub fn update_frame(update: &UpdateRow) -> ServerFrame {
    ServerFrame::Update {
        entity: update.entity_ref(),
        version: update.version,
        seq: update.seq,
        producer: ConnectionId::from(update.producer.as_str()),
        local_id: update.local_id.clone().into(),
        body: update.body.clone(),
        machine_status: update.machine_status,
        lifecycle: update.lifecycle,
    }
}

/// Wire frame for a stored message (used for fan-out and replay alike).
pub fn message_frame(message: &MessageRow) -> ServerFrame {
    ServerFrame::Message {
        session_id: message.session_id.clone().into(),
        message_id: message.id.clone().into(),
        seq: message.seq,
        producer: ConnectionId::from(message.producer.as_str()),
        local_id: message.local_id.clone().into(),
        created_at: message.created_at,
        body: message.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use happy_core::entities::EntityKind;
    use tokio::sync::mpsc;

    // Connection with its subscription already active, as it is after a
    // client's subscribe frame.
    fn make_conn(
        id: &str,
        account: &str,
        auto: Scope,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = ClientConnection::new(ConnectionId::from(id), account.into(), auto.clone(), tx);
        conn.subscribe(auto);
        (Arc::new(conn), rx)
    }

    fn update_row(account: &str, session: &str, seq: u64, producer: &str) -> UpdateRow {
        UpdateRow {
            account_id: account.into(),
            seq,
            entity_kind: EntityKind::Session,
            entity_id: session.into(),
            version: seq,
            local_id: format!("l{seq}"),
            producer: producer.into(),
            body: Some("Y2lwaGVy".into()),
            machine_status: None,
            lifecycle: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn add_and_remove_connections() {
        let hub = Hub::new();
        let (c1, _rx) = make_conn("c1", "acct", Scope::account("acct"));
        hub.add(c1).await;
        assert_eq!(hub.connection_count().await, 1);
        hub.remove("acct", &ConnectionId::from("c1")).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn update_reaches_scope_subscribers() {
        let hub = Hub::new();
        let (c1, mut rx1) = make_conn("c1", "acct", Scope::session("s-1"));
        let (c2, mut rx2) = make_conn("c2", "acct", Scope::session("s-2"));
        hub.add(c1).await;
        hub.add(c2).await;

        hub.fan_out_update(&update_row("acct", "s-1", 1, "elsewhere"), None)
            .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn account_scope_sees_all_sessions() {
        let hub = Hub::new();
        let (c1, mut rx1) = make_conn("c1", "acct", Scope::account("acct"));
        hub.add(c1).await;

        hub.fan_out_update(&update_row("acct", "s-9", 1, "x"), None)
            .await;

        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publisher_never_receives_own_update() {
        let hub = Hub::new();
        let (c1, mut rx1) = make_conn("c1", "acct", Scope::account("acct"));
        let (c2, mut rx2) = make_conn("c2", "acct", Scope::account("acct"));
        hub.add(c1).await;
        hub.add(c2).await;

        let row = update_row("acct", "s-1", 1, "c1");
        hub.fan_out_update(&row, Some(&ConnectionId::from("c1"))).await;

        assert!(rx1.try_recv().is_err(), "self-echo must be suppressed");
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn cross_account_traffic_is_isolated() {
        let hub = Hub::new();
        let (c1, mut rx1) = make_conn("c1", "acct-a", Scope::account("acct-a"));
        let (c2, mut rx2) = make_conn("c2", "acct-b", Scope::account("acct-b"));
        hub.add(c1).await;
        hub.add(c2).await;

        hub.fan_out_update(&update_row("acct-a", "s-1", 1, "x"), None)
            .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err(), "other accounts must never see it");
    }

    #[tokio::test]
    async fn message_fan_out_targets_session_scope() {
        let hub = Hub::new();
        let (c1, mut rx1) = make_conn("c1", "acct", Scope::session("s-1"));
        hub.add(c1).await;

        let row = MessageRow {
            account_id: "acct".into(),
            session_id: "s-1".into(),
            seq: 1,
            id: "m-1".into(),
            local_id: "l-1".into(),
            producer: "other".into(),
            body: "Ym9keQ==".into(),
            created_at: 5,
        };
        hub.fan_out_message(&row, None).await;

        let raw = rx1.try_recv().unwrap();
        let frame: ServerFrame = serde_json::from_str(&raw).unwrap();
        match frame {
            ServerFrame::Message { seq, session_id, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(session_id.as_str(), "s-1");
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_kicked() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::from("slow"),
            "acct".into(),
            Scope::account("acct"),
            tx,
        ));
        conn.subscribe(Scope::account("acct"));
        hub.add(conn.clone()).await;

        // First fills the buffer, second overflows.
        hub.fan_out_update(&update_row("acct", "s-1", 1, "x"), None)
            .await;
        assert!(!conn.cancel.is_cancelled());
        hub.fan_out_update(&update_row("acct", "s-1", 2, "x"), None)
            .await;
        assert!(conn.cancel.is_cancelled(), "overflowing subscriber is kicked");
    }

    #[tokio::test]
    async fn ephemeral_loss_is_silent() {
        let hub = Hub::new();
        // No connections at all: must not panic.
        hub.fan_out_ephemeral(
            "acct",
            &Scope::session("s-1"),
            &ServerFrame::Heartbeat { ts: 0 },
            None,
        )
        .await;
    }

    #[tokio::test]
    async fn replay_precedes_live_tail() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::from("c1"),
            "acct".into(),
            Scope::session("s-1"),
            tx,
        ));
        hub.add(conn.clone()).await;

        // Not yet subscribed: live updates pass it by.
        hub.fan_out_update(&update_row("acct", "s-1", 1, "x"), None)
            .await;
        assert!(rx.try_recv().is_err());

        // Subscribe with a replay of seq 1, then a live update lands.
        let replay = vec![ServerFrame::Heartbeat { ts: 1 }];
        hub.subscribe_and_replay(&conn, Scope::session("s-1"), replay)
            .await;
        hub.fan_out_update(&update_row("acct", "s-1", 2, "x"), None)
            .await;

        let first: ServerFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert!(matches!(first, ServerFrame::Heartbeat { .. }), "replay first");
        let second: ServerFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert!(matches!(second, ServerFrame::Update { seq: 2, .. }));
    }

    #[tokio::test]
    async fn ephemeral_uses_auto_scope_before_subscribe() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::from("c1"),
            "acct".into(),
            Scope::session("s-1"),
            tx,
        ));
        hub.add(conn).await;

        hub.fan_out_ephemeral(
            "acct",
            &Scope::session("s-1"),
            &ServerFrame::Heartbeat { ts: 9 },
            None,
        )
        .await;
        assert!(rx.try_recv().is_ok(), "auto scope admits ephemerals at once");
    }

    #[tokio::test]
    async fn get_returns_live_connection() {
        let hub = Hub::new();
        let (c1, _rx) = make_conn("c1", "acct", Scope::account("acct"));
        hub.add(c1).await;
        assert!(hub.get("acct", &ConnectionId::from("c1")).await.is_some());
        assert!(hub.get("acct", &ConnectionId::from("c2")).await.is_none());
        assert!(hub.get("other", &ConnectionId::from("c1")).await.is_none());
    }
}
