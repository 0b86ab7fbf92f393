//! End-to-end tests: a real relay, real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use happy_core::entities::{EntityRef, MachineStatus, Scope, SessionLifecycle};
use happy_core::protocol::{
    ClientFrame, ConnectionKind, RejectReason, RpcFailure, ServerFrame,
};
use happy_core::{CallId, ConnectionId, LocalId};
use happy_crypto::{MasterSecret, SecretBox};
use happy_relay::{metrics, RelayConfig, RelayServer};
use happy_store::{new_in_memory, run_migrations, ConnectionConfig, RelayStore};
use happy_sync::{MutateOptions, SyncClient, SyncConfig, SyncError, SyncEvent};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "integration-token";

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestRelay {
    server: Arc<RelayServer>,
    http_url: String,
    account_id: String,
}

/// Boot a relay on port 0 with one provisioned account.
async fn boot_relay(config: RelayConfig) -> TestRelay {
    let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    let store = Arc::new(RelayStore::new(pool));
    let account = store.create_account(TOKEN).unwrap();

    let server = Arc::new(RelayServer::new(config, store, metrics::test_recorder()));
    let (addr, _handle) = server.listen().await.unwrap();

    TestRelay {
        server,
        http_url: format!("http://{addr}"),
        account_id: account.id,
    }
}

/// Raw protocol client: socket + helpers.
struct RawClient {
    ws: WsStream,
    connection_id: ConnectionId,
}

impl RawClient {
    async fn connect(relay: &TestRelay, kind: ConnectionKind, scope_ref: Option<&str>) -> Self {
        let url = format!("{}/ws", relay.http_url.replace("http://", "ws://"));
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let auth = ClientFrame::Auth {
            token: TOKEN.into(),
            connection_kind: kind,
            scope_ref: scope_ref.map(str::to_owned),
        };
        ws.send(Message::Text(serde_json::to_string(&auth).unwrap().into()))
            .await
            .unwrap();

        let frame = recv_frame(&mut ws).await;
        let ServerFrame::AuthOk { connection_id, .. } = frame else {
            panic!("expected auth-ok, got {frame:?}");
        };
        Self { ws, connection_id }
    }

    async fn send(&mut self, frame: &ClientFrame) {
        self.ws
            .send(Message::Text(serde_json::to_string(frame).unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> ServerFrame {
        recv_frame(&mut self.ws).await
    }

    async fn recv_nothing(&mut self) {
        let result = timeout(Duration::from_millis(300), self.ws.next()).await;
        assert!(result.is_err(), "expected silence, got {result:?}");
    }

    async fn subscribe(&mut self, scope: Scope, since_seq: u64) {
        self.send(&ClientFrame::Subscribe {
            scope: scope.clone(),
            since_seq: Some(since_seq),
            since_message_seq: Some(0),
        })
        .await;
        let frame = self.recv().await;
        assert!(
            matches!(frame, ServerFrame::Subscribed { .. }),
            "expected subscribed, got {frame:?}"
        );
    }
}

async fn recv_frame(ws: &mut WsStream) -> ServerFrame {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("bad server frame")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

fn update_frame(entity: EntityRef, expected: u64, local_id: &str, body: &str) -> ClientFrame {
    ClientFrame::Update {
        entity,
        expected_version: expected,
        local_id: LocalId::from(local_id),
        body: Some(body.to_owned()),
        machine_status: None,
        lifecycle: None,
    }
}

// ── Scenario 1: basic publish/subscribe with echo suppression ────────

#[tokio::test]
async fn publish_reaches_subscriber_but_never_echoes() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-1")
        .unwrap();

    let mut c1 = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    let mut c2 =
        RawClient::connect(&relay, ConnectionKind::SessionScoped, Some(&session.id)).await;
    c1.subscribe(Scope::account(&relay.account_id), 0).await;
    c2.subscribe(Scope::session(&session.id), 0).await;

    c1.send(&update_frame(
        EntityRef::session(&session.id),
        0,
        "L1",
        "Y2lwaGVydGV4dA==",
    ))
    .await;

    // C1 gets the ack
    let ack = c1.recv().await;
    match ack {
        ServerFrame::UpdateAck {
            local_id,
            seq,
            new_version,
        } => {
            assert_eq!(local_id, LocalId::from("L1"));
            assert_eq!(seq, 1);
            assert_eq!(new_version, 1);
        }
        other => panic!("expected ack, got {other:?}"),
    }

    // C2 gets the update with producer = C1
    let update = c2.recv().await;
    match update {
        ServerFrame::Update {
            seq,
            version,
            producer,
            body,
            ..
        } => {
            assert_eq!(seq, 1);
            assert_eq!(version, 1);
            assert_eq!(producer, c1.connection_id);
            assert_eq!(body.as_deref(), Some("Y2lwaGVydGV4dA=="));
        }
        other => panic!("expected update, got {other:?}"),
    }

    // C1 must NOT receive its own echo
    c1.recv_nothing().await;
}

// ── Scenario 2: concurrent conflict, rebase-and-retry ────────────────

#[tokio::test]
async fn conflicting_publish_is_rejected_with_current_state() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-2")
        .unwrap();
    let entity = EntityRef::session(&session.id);

    let mut c1 = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    let mut c2 = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;

    // Both believe version is 0. C1 wins.
    c1.send(&update_frame(entity.clone(), 0, "L-a", "Qm9keVg=")).await;
    let ack = c1.recv().await;
    assert!(matches!(ack, ServerFrame::UpdateAck { new_version: 1, .. }));

    c2.send(&update_frame(entity.clone(), 0, "L-b", "Qm9keVk=")).await;
    let reject = c2.recv().await;
    match reject {
        ServerFrame::UpdateReject {
            reason,
            current_version,
            current_body,
            ..
        } => {
            assert_eq!(reason, RejectReason::VersionMismatch);
            assert_eq!(current_version, Some(1));
            assert_eq!(current_body.as_deref(), Some("Qm9keVg="));
        }
        other => panic!("expected reject, got {other:?}"),
    }

    // C2 rebases onto the authoritative version and succeeds.
    c2.send(&update_frame(entity, 1, "L-b", "Qm9keVla")).await;
    let ack = c2.recv().await;
    assert!(matches!(ack, ServerFrame::UpdateAck { new_version: 2, .. }));
}

// ── Scenario 3: reconnect with gap replays in order ──────────────────

#[tokio::test]
async fn reconnect_with_cursor_replays_missed_updates_in_order() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-3")
        .unwrap();
    let entity = EntityRef::session(&session.id);

    let mut publisher = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    for i in 0..5u64 {
        publisher
            .send(&update_frame(entity.clone(), i, &format!("L{i}"), "Ym9keQ=="))
            .await;
        let ack = publisher.recv().await;
        assert!(matches!(ack, ServerFrame::UpdateAck { .. }));
    }

    // A client that saw only seq 1..=2 reconnects with its cursor.
    let mut late = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    late.send(&ClientFrame::Subscribe {
        scope: Scope::account(&relay.account_id),
        since_seq: Some(2),
        since_message_seq: None,
    })
    .await;

    let frame = late.recv().await;
    assert!(matches!(frame, ServerFrame::Subscribed { .. }));
    for expected_seq in 3..=5u64 {
        let frame = late.recv().await;
        match frame {
            ServerFrame::Update { seq, .. } => assert_eq!(seq, expected_seq),
            other => panic!("expected update {expected_seq}, got {other:?}"),
        }
    }

    // And it is live-tailed from here on.
    publisher
        .send(&update_frame(entity, 5, "L-live", "bGl2ZQ=="))
        .await;
    let _ = publisher.recv().await;
    let frame = late.recv().await;
    assert!(matches!(frame, ServerFrame::Update { seq: 6, .. }));
}

// ── Scenario 3b: cursor below the retention horizon ──────────────────

#[tokio::test]
async fn cursor_below_horizon_gets_resync_required() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-4")
        .unwrap();
    let entity = EntityRef::session(&session.id);

    let mut publisher = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    for i in 0..10u64 {
        publisher
            .send(&update_frame(entity.clone(), i, &format!("L{i}"), "Ym9keQ=="))
            .await;
        let _ = publisher.recv().await;
    }
    // Prune so only the last 3 remain; horizon is 7.
    let pruned = relay
        .server
        .store()
        .prune_updates(&relay.account_id, 3)
        .unwrap();
    assert_eq!(pruned, 7);

    let mut late = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    late.send(&ClientFrame::Subscribe {
        scope: Scope::account(&relay.account_id),
        since_seq: Some(2),
        since_message_seq: None,
    })
    .await;

    let frame = late.recv().await;
    match frame {
        ServerFrame::ResyncRequired { min_seq, .. } => assert_eq!(min_seq, 7),
        other => panic!("expected resync-required, got {other:?}"),
    }
}

// ── Scenario 4: RPC without a handler fails fast ─────────────────────

#[tokio::test]
async fn rpc_with_no_handler_fails_within_one_round_trip() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-5")
        .unwrap();

    let mut caller = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    let started = std::time::Instant::now();
    caller
        .send(&ClientFrame::RpcCall {
            call_id: CallId::from("call-1"),
            target_scope: Scope::session(&session.id),
            method: "session.readFile".into(),
            timeout_ms: 30_000,
            request: "cmVx".into(),
        })
        .await;

    let frame = caller.recv().await;
    assert_eq!(
        frame,
        ServerFrame::RpcError {
            call_id: CallId::from("call-1"),
            reason: RpcFailure::NoHandler
        }
    );
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "no-handler must not wait for the timeout"
    );
}

// ── RPC round trip through the broker ────────────────────────────────

#[tokio::test]
async fn rpc_round_trip_between_sync_clients() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-6")
        .unwrap();
    let scope = Scope::session(&session.id);

    let secret = MasterSecret::random();
    let crypto = SecretBox::new(&secret.derive_content_key(&relay.account_id));

    let handler_client = SyncClient::connect(
        SyncConfig {
            connection_kind: ConnectionKind::SessionScoped,
            scope_ref: Some(session.id.clone()),
            ..SyncConfig::new(&relay.http_url, TOKEN)
        },
        crypto.clone(),
    )
    .await
    .unwrap();
    handler_client
        .register(scope.clone(), "session.readFile", |req| {
            Box::pin(async move {
                assert_eq!(req["path"], "/foo");
                Ok(json!({"content": "file body"}))
            })
        })
        .await
        .unwrap();

    let caller = SyncClient::connect(SyncConfig::new(&relay.http_url, TOKEN), crypto)
        .await
        .unwrap();

    // Registration is async; retry until routed.
    let mut result = None;
    for _ in 0..20 {
        match caller
            .invoke(
                scope.clone(),
                "session.readFile",
                json!({"path": "/foo"}),
                Duration::from_secs(3),
            )
            .await
        {
            Ok(value) => {
                result = Some(value);
                break;
            }
            Err(SyncError::NoHandler) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(other) => panic!("unexpected rpc failure: {other:?}"),
        }
    }
    assert_eq!(result.expect("handler never became routable")["content"], "file body");
}

// ── Sync-client conflict resolution end to end ───────────────────────

#[tokio::test]
async fn two_sync_clients_converge_after_conflict() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-7")
        .unwrap();
    let entity = EntityRef::session(&session.id);
    let scope = Scope::session(&session.id);

    let secret = MasterSecret::random();
    let crypto = SecretBox::new(&secret.derive_content_key(&relay.account_id));

    let a = SyncClient::connect(SyncConfig::new(&relay.http_url, TOKEN), crypto.clone())
        .await
        .unwrap();
    let b = SyncClient::connect(SyncConfig::new(&relay.http_url, TOKEN), crypto)
        .await
        .unwrap();
    a.subscribe(scope.clone()).await.unwrap();
    b.subscribe(scope).await.unwrap();

    let v1 = a
        .mutate(entity.clone(), MutateOptions::default(), |_| {
            json!({"who": "a"})
        })
        .await
        .unwrap();
    assert_eq!(v1, 1);

    // B still believes version 0; its publish conflicts, rebases, and
    // lands as version 2.
    let v2 = b
        .mutate(entity.clone(), MutateOptions::default(), |current| {
            let mut doc = current.cloned().unwrap_or_else(|| json!({}));
            doc["also"] = json!("b");
            doc
        })
        .await
        .unwrap();
    assert_eq!(v2, 2);

    // The rebase preserved A's write.
    let (version, body) = b.entity(entity).await.unwrap();
    assert_eq!(version, 2);
    let body = body.unwrap();
    assert_eq!(body["who"], "a");
    assert_eq!(body["also"], "b");
}

// ── Message log: idempotent append + fan-out ─────────────────────────

#[tokio::test]
async fn message_append_is_idempotent_and_fans_out() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-8")
        .unwrap();

    let mut sender = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    let mut observer =
        RawClient::connect(&relay, ConnectionKind::SessionScoped, Some(&session.id)).await;
    observer.subscribe(Scope::session(&session.id), 0).await;

    let append = ClientFrame::Message {
        session_id: session.id.clone().into(),
        local_id: LocalId::from("M1"),
        body: "bXNn".into(),
    };
    sender.send(&append).await;
    let first = sender.recv().await;
    let ServerFrame::MessageAck { seq: first_seq, message_id, .. } = first else {
        panic!("expected message ack, got {first:?}");
    };
    assert_eq!(first_seq, 1);

    // Retry with the same localId coalesces to the same message.
    sender.send(&append).await;
    let second = sender.recv().await;
    match second {
        ServerFrame::MessageAck { seq, message_id: retry_id, .. } => {
            assert_eq!(seq, first_seq);
            assert_eq!(retry_id, message_id);
        }
        other => panic!("expected ack, got {other:?}"),
    }

    // Exactly one delivery to the observer.
    let delivered = observer.recv().await;
    assert!(matches!(delivered, ServerFrame::Message { seq: 1, .. }));
    observer.recv_nothing().await;

    // And exactly one row in the log.
    let rows = relay
        .server
        .store()
        .messages_since(&relay.account_id, &session.id, 0)
        .unwrap();
    assert_eq!(rows.len(), 1);
}

// ── Archived sessions are immutable ──────────────────────────────────

#[tokio::test]
async fn archived_session_rejects_appends() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-9")
        .unwrap();

    let mut cli = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    cli.send(&ClientFrame::Update {
        entity: EntityRef::session(&session.id),
        expected_version: 0,
        local_id: LocalId::from("end"),
        body: None,
        machine_status: None,
        lifecycle: Some(SessionLifecycle::Archived),
    })
    .await;
    let ack = cli.recv().await;
    assert!(matches!(ack, ServerFrame::UpdateAck { .. }));

    cli.send(&ClientFrame::Message {
        session_id: session.id.clone().into(),
        local_id: LocalId::from("late"),
        body: "bGF0ZQ==".into(),
    })
    .await;
    let reject = cli.recv().await;
    match reject {
        ServerFrame::UpdateReject { reason, .. } => assert_eq!(reason, RejectReason::Auth),
        other => panic!("expected reject, got {other:?}"),
    }
}

// ── Invariant 5: killed daemon decays to machine-offline ─────────────

#[tokio::test]
async fn dead_machine_connection_decays_to_offline_update() {
    let config = RelayConfig {
        machine_offline_grace_secs: 1,
        ..RelayConfig::default()
    };
    let relay = boot_relay(config).await;

    let daemon = RawClient::connect(&relay, ConnectionKind::MachineScoped, Some("m-host")).await;

    // An observer watching the account sees presence as persistent updates.
    let mut observer = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    observer.subscribe(Scope::account(&relay.account_id), 0).await;

    // The connect itself produced the online transition.
    let online = observer.recv().await;
    match online {
        ServerFrame::Update { machine_status, .. } => {
            assert_eq!(machine_status, Some(MachineStatus::Online));
        }
        other => panic!("expected online update, got {other:?}"),
    }

    // Kill the daemon socket without ceremony (kill -9 equivalent).
    drop(daemon);

    let offline = timeout(TIMEOUT, observer.recv()).await.expect("offline update");
    match offline {
        ServerFrame::Update { machine_status, .. } => {
            assert_eq!(machine_status, Some(MachineStatus::Offline));
        }
        other => panic!("expected offline update, got {other:?}"),
    }
}

// ── Ephemeral events: best-effort, sender excluded ───────────────────

#[tokio::test]
async fn ephemeral_events_reach_scope_members_not_sender() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-10")
        .unwrap();

    let mut typist =
        RawClient::connect(&relay, ConnectionKind::SessionScoped, Some(&session.id)).await;
    let mut watcher = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;

    typist
        .send(&ClientFrame::Ephemeral {
            scope: Scope::session(&session.id),
            kind: "typing".into(),
            ts: 1,
            payload: None,
        })
        .await;

    let frame = watcher.recv().await;
    match frame {
        ServerFrame::Ephemeral { kind, .. } => assert_eq!(kind, "typing"),
        other => panic!("expected ephemeral, got {other:?}"),
    }
    typist.recv_nothing().await;
}

// ── Protocol violations drop the connection ──────────────────────────

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let relay = boot_relay(RelayConfig::default()).await;
    let url = format!("{}/ws", relay.http_url.replace("http://", "ws://"));
    let (mut ws, _) = connect_async(&url).await.unwrap();

    // Authenticate properly first.
    let auth = ClientFrame::Auth {
        token: TOKEN.into(),
        connection_kind: ConnectionKind::UserScoped,
        scope_ref: None,
    };
    ws.send(Message::Text(serde_json::to_string(&auth).unwrap().into()))
        .await
        .unwrap();
    let _ = recv_frame(&mut ws).await;

    ws.send(Message::Text("{\"type\":\"not-a-frame\"}".into()))
        .await
        .unwrap();

    // The server closes; the stream ends.
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None => return true,
                Some(Ok(Message::Close(_))) => return true,
                Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "protocol violation must drop the connection");
}

// ── Bad credentials are refused before anything else ─────────────────

#[tokio::test]
async fn bad_token_gets_auth_reject() {
    let relay = boot_relay(RelayConfig::default()).await;
    let url = format!("{}/ws", relay.http_url.replace("http://", "ws://"));
    let (mut ws, _) = connect_async(&url).await.unwrap();

    let auth = ClientFrame::Auth {
        token: "wrong".into(),
        connection_kind: ConnectionKind::UserScoped,
        scope_ref: None,
    };
    ws.send(Message::Text(serde_json::to_string(&auth).unwrap().into()))
        .await
        .unwrap();

    let frame = recv_frame(&mut ws).await;
    assert!(matches!(frame, ServerFrame::AuthReject { .. }));
}

// ── Foreign scopes cannot be subscribed ──────────────────────────────

#[tokio::test]
async fn foreign_session_subscription_is_refused() {
    let relay = boot_relay(RelayConfig::default()).await;
    // A second account with its own session.
    let other = relay.server.store().create_account("other-token").unwrap();
    let foreign = relay
        .server
        .store()
        .create_session(&other.id, "their-tag")
        .unwrap();

    let mut spy = RawClient::connect(&relay, ConnectionKind::UserScoped, None).await;
    spy.send(&ClientFrame::Subscribe {
        scope: Scope::session(&foreign.id),
        since_seq: Some(0),
        since_message_seq: None,
    })
    .await;
    // No subscribed ack, no data: the request is silently refused.
    spy.recv_nothing().await;
}

// ── Sync client reconnects and converges ─────────────────────────────

#[tokio::test]
async fn sync_client_sees_updates_published_while_connected_elsewhere() {
    let relay = boot_relay(RelayConfig::default()).await;
    let session = relay
        .server
        .store()
        .create_session(&relay.account_id, "tag-11")
        .unwrap();
    let entity = EntityRef::session(&session.id);
    let scope = Scope::session(&session.id);

    let secret = MasterSecret::random();
    let crypto = SecretBox::new(&secret.derive_content_key(&relay.account_id));

    let observer = SyncClient::connect(SyncConfig::new(&relay.http_url, TOKEN), crypto.clone())
        .await
        .unwrap();
    let mut events = observer.events();
    observer.subscribe(scope).await.unwrap();

    let writer = SyncClient::connect(SyncConfig::new(&relay.http_url, TOKEN), crypto)
        .await
        .unwrap();
    let _ = writer
        .mutate(entity.clone(), MutateOptions::default(), |_| {
            json!({"published": true})
        })
        .await
        .unwrap();

    let applied = timeout(TIMEOUT, async {
        loop {
            if let Ok(SyncEvent::UpdateApplied { entity: e, body, .. }) = events.recv().await {
                if e == entity {
                    return body;
                }
            }
        }
    })
    .await
    .expect("update event");
    assert_eq!(applied.unwrap()["published"], true);
}
