//! WebSocket session lifecycle — one authenticated client from upgrade
//! through disconnect.
//!
//! Connection state machine: the first frame must be `auth` (within the
//! auth timeout), after which the socket is admitted to the hub and the
//! dispatch loop runs until transport close, heartbeat timeout, a kick
//! (outbound overflow), server drain, or a protocol violation.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use happy_core::entities::{EntityKind, Scope, ScopeKind};
use happy_core::protocol::{ClientFrame, ConnectionKind, RejectReason, ServerFrame};
use happy_core::{now_ms, ConnectionId};
use happy_store::{MessageOutcome, PublishOutcome, PublishRequest, Replay, StoreError};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth;
use crate::config::RelayConfig;
use crate::metrics::{
    MESSAGES_APPENDED_TOTAL, UPDATES_PUBLISHED_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
};
use crate::presence::PresenceTracker;
use crate::rpc::RpcBroker;
use crate::shutdown::ShutdownCoordinator;
use crate::ws::connection::ClientConnection;
use crate::ws::heartbeat::run_heartbeat;
use crate::ws::hub::{message_frame, update_frame, Hub};

use happy_store::RelayStore;

/// Shared dependencies of every socket task.
pub struct WsDeps {
    /// Server configuration.
    pub config: RelayConfig,
    /// Durable store.
    pub store: Arc<RelayStore>,
    /// Fan-out hub.
    pub hub: Arc<Hub>,
    /// RPC broker.
    pub broker: Arc<RpcBroker>,
    /// Machine presence tracker.
    pub presence: Arc<PresenceTracker>,
    /// Server drain signal.
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Run one WebSocket session to completion.
#[instrument(skip_all)]
pub async fn run_ws_session(ws: WebSocket, deps: Arc<WsDeps>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // ── Auth phase ──────────────────────────────────────────────────
    let auth_budget = std::time::Duration::from_secs(deps.config.auth_timeout_secs);
    let first = match tokio::time::timeout(auth_budget, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
        _ => {
            debug!("socket closed before auth");
            return;
        }
    };

    let (token, kind, scope_ref) = match serde_json::from_str::<ClientFrame>(&first) {
        Ok(ClientFrame::Auth {
            token,
            connection_kind,
            scope_ref,
        }) => (token, connection_kind, scope_ref),
        _ => {
            let _ = send_direct(&mut ws_tx, &ServerFrame::AuthReject {
                reason: "first frame must be auth".into(),
            })
            .await;
            return;
        }
    };

    let authed = match auth::authenticate(&deps.store, &token, kind, scope_ref.as_deref()) {
        Ok(a) => a,
        Err(e) => {
            info!(error = %e, "authentication refused");
            let _ = send_direct(&mut ws_tx, &ServerFrame::AuthReject {
                reason: e.to_string(),
            })
            .await;
            return;
        }
    };

    // ── Admission ───────────────────────────────────────────────────
    let connection_id = ConnectionId::new();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(deps.config.outbound_buffer);
    let conn = Arc::new(ClientConnection::new(
        connection_id.clone(),
        authed.account_id.clone(),
        authed.auto_scope.clone(),
        send_tx,
    ));

    deps.hub.add(conn.clone()).await;
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(conn_id = %connection_id, account_id = %authed.account_id, "client connected");

    let _ = send_direct(&mut ws_tx, &ServerFrame::AuthOk {
        connection_id: connection_id.clone(),
        account_id: authed.account_id.clone().into(),
        server_time: now_ms(),
    })
    .await;

    let is_machine_conn = matches!(kind, ConnectionKind::MachineScoped);
    if is_machine_conn {
        deps.presence
            .machine_connected(&authed.account_id, &authed.auto_scope.id)
            .await;
    }

    // ── Pumps ───────────────────────────────────────────────────────
    let outbound = tokio::spawn(async move {
        while let Some(msg) = send_rx.recv().await {
            if ws_tx.send(Message::Text((*msg).clone().into())).await.is_err() {
                break;
            }
        }
    });

    let hb_cancel = CancellationToken::new();
    let mut hb = tokio::spawn(run_heartbeat(
        conn.clone(),
        std::time::Duration::from_secs(deps.config.heartbeat_interval_secs),
        std::time::Duration::from_secs(deps.config.heartbeat_timeout_secs),
        hb_cancel.clone(),
    ));

    let drain = deps.shutdown.token();

    // ── Dispatch loop ───────────────────────────────────────────────
    loop {
        tokio::select! {
            () = conn.cancel.cancelled() => {
                info!(conn_id = %connection_id, "connection kicked");
                break;
            }
            () = drain.cancelled() => {
                debug!(conn_id = %connection_id, "server drain");
                break;
            }
            _ = &mut hb => {
                info!(conn_id = %connection_id, "heartbeat timeout");
                break;
            }
            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else {
                    break;
                };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {
                        conn.mark_alive();
                        continue;
                    }
                    Message::Binary(_) => {
                        warn!(conn_id = %connection_id, "binary frame, dropping connection");
                        break;
                    }
                };
                conn.mark_alive();

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(conn_id = %connection_id, error = %e, "protocol violation");
                        break;
                    }
                };
                if !handle_frame(&deps, &conn, frame).await {
                    break;
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────
    hb_cancel.cancel();
    outbound.abort();
    deps.hub.remove(&authed.account_id, &connection_id).await;
    deps.broker
        .connection_closed(&deps.hub, &connection_id)
        .await;
    if is_machine_conn {
        deps.presence
            .machine_disconnected(authed.account_id.clone(), authed.auto_scope.id.clone());
    }
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(conn_id = %connection_id, "client disconnected");
}

async fn send_direct<S>(ws_tx: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Dispatch one frame. Returns `false` when the connection must close
/// (protocol violation).
async fn handle_frame(deps: &Arc<WsDeps>, conn: &Arc<ClientConnection>, frame: ClientFrame) -> bool {
    match frame {
        ClientFrame::Auth { .. } => {
            warn!(conn_id = %conn.id, "repeated auth frame");
            false
        }
        ClientFrame::Heartbeat { .. } => {
            let _ = conn.send(&ServerFrame::Heartbeat { ts: now_ms() });
            true
        }
        ClientFrame::Subscribe {
            scope,
            since_seq,
            since_message_seq,
        } => {
            handle_subscribe(deps, conn, scope, since_seq, since_message_seq).await;
            true
        }
        ClientFrame::Update {
            entity,
            expected_version,
            local_id,
            body,
            machine_status,
            lifecycle,
        } => {
            // Publishing to the account entity of someone else is the
            // only cross-account shape the store itself can't catch.
            if entity.kind == EntityKind::Account && entity.id != conn.account_id {
                let _ = conn.send(&ServerFrame::UpdateReject {
                    local_id,
                    reason: RejectReason::Auth,
                    current_version: None,
                    current_body: None,
                });
                return true;
            }
            let outcome = deps.store.publish_update(&PublishRequest {
                account_id: conn.account_id.clone(),
                producer: conn.id.to_string(),
                entity,
                expected_version,
                local_id: local_id.to_string(),
                body,
                machine_status,
                lifecycle,
            });
            match outcome {
                Ok(PublishOutcome::Committed { update }) => {
                    counter!(UPDATES_PUBLISHED_TOTAL, "outcome" => "committed").increment(1);
                    let _ = conn.send(&ServerFrame::UpdateAck {
                        local_id,
                        seq: update.seq,
                        new_version: update.version,
                    });
                    deps.hub.fan_out_update(&update, Some(&conn.id)).await;
                }
                Ok(PublishOutcome::Duplicate { seq, version }) => {
                    counter!(UPDATES_PUBLISHED_TOTAL, "outcome" => "duplicate").increment(1);
                    let _ = conn.send(&ServerFrame::UpdateAck {
                        local_id,
                        seq,
                        new_version: version,
                    });
                }
                Ok(PublishOutcome::VersionMismatch {
                    current_version,
                    current_body,
                }) => {
                    counter!(UPDATES_PUBLISHED_TOTAL, "outcome" => "version_mismatch")
                        .increment(1);
                    let _ = conn.send(&ServerFrame::UpdateReject {
                        local_id,
                        reason: RejectReason::VersionMismatch,
                        current_version: Some(current_version),
                        current_body,
                    });
                }
                Err(StoreError::NotFound { .. }) => {
                    let _ = conn.send(&ServerFrame::UpdateReject {
                        local_id,
                        reason: RejectReason::Auth,
                        current_version: None,
                        current_body: None,
                    });
                }
                Err(e) => {
                    // Durability failure: the client must retry (its
                    // localId makes the retry idempotent).
                    warn!(error = %e, "publish failed");
                    let _ = conn.send(&ServerFrame::UpdateReject {
                        local_id,
                        reason: RejectReason::RateLimit,
                        current_version: None,
                        current_body: None,
                    });
                }
            }
            true
        }
        ClientFrame::Message {
            session_id,
            local_id,
            body,
        } => {
            let outcome = deps.store.append_message(
                &conn.account_id,
                session_id.as_str(),
                conn.id.as_str(),
                local_id.as_str(),
                &body,
            );
            match outcome {
                Ok(MessageOutcome::Appended { message }) => {
                    counter!(MESSAGES_APPENDED_TOTAL, "outcome" => "appended").increment(1);
                    let _ = conn.send(&ServerFrame::MessageAck {
                        local_id,
                        session_id,
                        message_id: message.id.clone().into(),
                        seq: message.seq,
                    });
                    deps.hub.fan_out_message(&message, Some(&conn.id)).await;
                }
                Ok(MessageOutcome::Duplicate { message }) => {
                    counter!(MESSAGES_APPENDED_TOTAL, "outcome" => "duplicate").increment(1);
                    let _ = conn.send(&ServerFrame::MessageAck {
                        local_id,
                        session_id,
                        message_id: message.id.clone().into(),
                        seq: message.seq,
                    });
                }
                Ok(MessageOutcome::Archived) | Err(StoreError::NotFound { .. }) => {
                    counter!(MESSAGES_APPENDED_TOTAL, "outcome" => "rejected").increment(1);
                    let _ = conn.send(&ServerFrame::UpdateReject {
                        local_id,
                        reason: RejectReason::Auth,
                        current_version: None,
                        current_body: None,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "message append failed");
                    let _ = conn.send(&ServerFrame::UpdateReject {
                        local_id,
                        reason: RejectReason::RateLimit,
                        current_version: None,
                        current_body: None,
                    });
                }
            }
            true
        }
        ClientFrame::Ephemeral {
            scope,
            kind,
            ts,
            payload,
        } => {
            if auth::authorize_scope(&deps.store, &conn.account_id, &scope).is_err() {
                // Ephemeral loss is not an error; unauthorized ones just
                // vanish.
                return true;
            }
            let frame = ServerFrame::Ephemeral {
                scope: scope.clone(),
                kind,
                ts,
                payload,
            };
            deps.hub
                .fan_out_ephemeral(&conn.account_id, &scope, &frame, Some(&conn.id))
                .await;
            true
        }
        ClientFrame::RpcRegister { scope, method } => {
            if auth::authorize_scope(&deps.store, &conn.account_id, &scope).is_err() {
                warn!(conn_id = %conn.id, scope = %scope, "unauthorized rpc register");
                return true;
            }
            deps.broker
                .register(&conn.account_id, &scope, &method, conn.id.clone());
            true
        }
        ClientFrame::RpcCall {
            call_id,
            target_scope,
            method,
            timeout_ms,
            request,
        } => {
            if auth::authorize_scope(&deps.store, &conn.account_id, &target_scope).is_err() {
                let _ = conn.send(&ServerFrame::RpcError {
                    call_id,
                    reason: happy_core::protocol::RpcFailure::NoHandler,
                });
                return true;
            }
            let timeout_ms = timeout_ms.clamp(1, deps.config.max_rpc_timeout_ms);
            deps.broker
                .call(
                    &deps.hub,
                    &conn.account_id,
                    &conn.id,
                    call_id,
                    target_scope,
                    method,
                    timeout_ms,
                    request,
                )
                .await;
            true
        }
        ClientFrame::RpcResponse {
            call_id,
            ok,
            response,
            error_body,
        } => {
            deps.broker
                .on_response(&deps.hub, &conn.id, call_id, ok, response, error_body)
                .await;
            true
        }
    }
}

async fn handle_subscribe(
    deps: &Arc<WsDeps>,
    conn: &Arc<ClientConnection>,
    scope: Scope,
    since_seq: Option<u64>,
    since_message_seq: Option<u64>,
) {
    if auth::authorize_scope(&deps.store, &conn.account_id, &scope).is_err() {
        warn!(conn_id = %conn.id, scope = %scope, "unauthorized subscribe refused");
        return;
    }

    let current_seq = match deps.store.current_seq(&conn.account_id) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "subscribe failed");
            return;
        }
    };
    // No cursor: live tail only, from now.
    let cursor = since_seq.unwrap_or(current_seq);

    let replay_rows = match deps.store.updates_since(&conn.account_id, cursor) {
        Ok(Replay::Updates(rows)) => rows,
        Ok(Replay::ResyncRequired { min_seq }) => {
            let _ = conn.send(&ServerFrame::ResyncRequired {
                scope,
                min_seq,
            });
            return;
        }
        Err(e) => {
            warn!(error = %e, "replay lookup failed");
            return;
        }
    };

    let mut frames = Vec::with_capacity(replay_rows.len() + 2);
    frames.push(ServerFrame::Subscribed {
        scope: scope.clone(),
        since_seq: current_seq,
        since_message_seq: if scope.kind == ScopeKind::Session {
            Some(
                deps.store
                    .get_session(&conn.account_id, &scope.id)
                    .ok()
                    .flatten()
                    .map(|s| s.last_message_seq)
                    .unwrap_or(0),
            )
        } else {
            None
        },
    });
    frames.extend(
        replay_rows
            .iter()
            .filter(|row| scope_matches(&scope, row))
            .map(update_frame),
    );

    if scope.kind == ScopeKind::Session {
        if let Some(msg_cursor) = since_message_seq {
            match deps
                .store
                .messages_since(&conn.account_id, &scope.id, msg_cursor)
            {
                Ok(messages) => frames.extend(messages.iter().map(message_frame)),
                Err(e) => warn!(error = %e, "message replay failed"),
            }
        }
    }

    deps.hub.subscribe_and_replay(conn, scope, frames).await;
}

// Replays to an account scope carry everything; narrower scopes only
// their own entity's updates.
fn scope_matches(scope: &Scope, row: &happy_store::UpdateRow) -> bool {
    match scope.kind {
        ScopeKind::Account => true,
        _ => row.entity_ref().scope() == *scope,
    }
}

#[cfg(test)]
mod tests {
    // The socket loop is exercised end-to-end (real server, real
    // tokio-tungstenite clients) in tests/integration.rs. Unit tests
    // here cover the pure helpers.

    use super::*;
    use happy_core::entities::EntityRef;

    fn row(kind: EntityKind, id: &str) -> happy_store::UpdateRow {
        happy_store::UpdateRow {
            account_id: "acct".into(),
            seq: 1,
            entity_kind: kind,
            entity_id: id.into(),
            version: 1,
            local_id: "l".into(),
            producer: "c".into(),
            body: None,
            machine_status: None,
            lifecycle: None,
            created_at: 0,
        }
    }

    #[test]
    fn account_scope_matches_everything() {
        let scope = Scope::account("acct");
        assert!(scope_matches(&scope, &row(EntityKind::Session, "s-1")));
        assert!(scope_matches(&scope, &row(EntityKind::Machine, "m-1")));
    }

    #[test]
    fn session_scope_matches_only_itself() {
        let scope = Scope::session("s-1");
        assert!(scope_matches(&scope, &row(EntityKind::Session, "s-1")));
        assert!(!scope_matches(&scope, &row(EntityKind::Session, "s-2")));
        assert!(!scope_matches(&scope, &row(EntityKind::Machine, "s-1")));
    }

    #[test]
    fn entity_ref_scope_agrees_with_matching() {
        let r = row(EntityKind::Machine, "m-9");
        assert_eq!(
            EntityRef::machine("m-9").scope(),
            r.entity_ref().scope()
        );
    }
}
