//! RPC brokering between client endpoints.
//!
//! Each `(account, scope, method)` has at most one primary handler: the
//! most recently registered connection. Calls route only to it; when it
//! is absent the caller gets `no-handler` within one round trip instead
//! of waiting out its timeout. Either endpoint may vanish mid-call — the
//! pending-call table resolves every call to exactly one of
//! {response, no-handler, timeout, transport}.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use happy_core::entities::Scope;
use happy_core::protocol::{RpcFailure, ServerFrame};
use happy_core::{CallId, ConnectionId};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::metrics::{RPC_CALLS_TOTAL, RPC_CALL_DURATION_SECONDS};
use crate::ws::hub::Hub;

type HandlerKey = (String, String, String); // (account, scope, method)

struct PendingCall {
    account_id: String,
    caller: ConnectionId,
    handler: ConnectionId,
    started: Instant,
}

/// Brokers calls between caller and handler connections.
pub struct RpcBroker {
    handlers: DashMap<HandlerKey, ConnectionId>,
    pending: DashMap<CallId, PendingCall>,
}

impl RpcBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    fn key(account_id: &str, scope: &Scope, method: &str) -> HandlerKey {
        (account_id.to_owned(), scope.to_string(), method.to_owned())
    }

    /// Register `conn` as the primary handler for `(scope, method)`.
    /// The most recent registration wins.
    pub fn register(&self, account_id: &str, scope: &Scope, method: &str, conn: ConnectionId) {
        let _ = self
            .handlers
            .insert(Self::key(account_id, scope, method), conn);
        debug!(scope = %scope, method, "rpc handler registered");
    }

    /// The current handler, if any.
    pub fn handler_for(&self, account_id: &str, scope: &Scope, method: &str) -> Option<ConnectionId> {
        self.handlers
            .get(&Self::key(account_id, scope, method))
            .map(|h| h.clone())
    }

    /// Broker one call.
    ///
    /// Forwards the request to the handler connection and arms a timeout.
    /// Every failure path answers the caller immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn call(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        account_id: &str,
        caller: &ConnectionId,
        call_id: CallId,
        target_scope: Scope,
        method: String,
        timeout_ms: u64,
        request: String,
    ) {
        let Some(handler_id) = self.handler_for(account_id, &target_scope, &method) else {
            counter!(RPC_CALLS_TOTAL, "outcome" => "no_handler").increment(1);
            self.answer(hub, account_id, caller, ServerFrame::RpcError {
                call_id,
                reason: RpcFailure::NoHandler,
            })
            .await;
            return;
        };

        let Some(handler_conn) = hub.get(account_id, &handler_id).await else {
            // Stale registration: the handler's socket is gone.
            let _ = self
                .handlers
                .remove(&Self::key(account_id, &target_scope, &method));
            counter!(RPC_CALLS_TOTAL, "outcome" => "no_handler").increment(1);
            self.answer(hub, account_id, caller, ServerFrame::RpcError {
                call_id,
                reason: RpcFailure::NoHandler,
            })
            .await;
            return;
        };

        let _ = self.pending.insert(
            call_id.clone(),
            PendingCall {
                account_id: account_id.to_owned(),
                caller: caller.clone(),
                handler: handler_id.clone(),
                started: Instant::now(),
            },
        );

        let forwarded = handler_conn.send(&ServerFrame::RpcCall {
            call_id: call_id.clone(),
            target_scope,
            method,
            timeout_ms,
            request,
        });
        if !forwarded {
            let _ = self.pending.remove(&call_id);
            counter!(RPC_CALLS_TOTAL, "outcome" => "transport").increment(1);
            self.answer(hub, account_id, caller, ServerFrame::RpcError {
                call_id,
                reason: RpcFailure::Transport,
            })
            .await;
            return;
        }

        // Arm the timeout. Expiry synthesizes a `timeout` result for the
        // caller and releases the pending slot.
        let broker = Arc::clone(self);
        let hub = Arc::clone(hub);
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some((_, pend)) = broker.pending.remove(&call_id) {
                counter!(RPC_CALLS_TOTAL, "outcome" => "timeout").increment(1);
                warn!(call_id = %call_id, "rpc call timed out");
                broker
                    .answer(&hub, &pend.account_id, &pend.caller, ServerFrame::RpcError {
                        call_id,
                        reason: RpcFailure::Timeout,
                    })
                    .await;
            }
        });
    }

    /// A handler responded; forward the result to the caller.
    ///
    /// Responses from anyone but the recorded handler are discarded.
    pub async fn on_response(
        &self,
        hub: &Arc<Hub>,
        responder: &ConnectionId,
        call_id: CallId,
        ok: bool,
        response: Option<String>,
        error_body: Option<String>,
    ) {
        let Some(entry) = self.pending.get(&call_id) else {
            debug!(call_id = %call_id, "response for unknown call (late or duplicate)");
            return;
        };
        if entry.handler != *responder {
            warn!(call_id = %call_id, "response from non-handler connection, discarding");
            return;
        }
        drop(entry);
        let Some((_, pend)) = self.pending.remove(&call_id) else {
            return;
        };

        counter!(RPC_CALLS_TOTAL, "outcome" => if ok { "ok" } else { "handler_error" })
            .increment(1);
        histogram!(RPC_CALL_DURATION_SECONDS).record(pend.started.elapsed().as_secs_f64());

        self.answer(
            hub,
            &pend.account_id,
            &pend.caller,
            ServerFrame::RpcResponse {
                call_id,
                ok,
                response,
                error_body,
            },
        )
        .await;
    }

    /// A connection closed: drop its registrations and fail its calls.
    pub async fn connection_closed(&self, hub: &Arc<Hub>, conn: &ConnectionId) {
        self.handlers.retain(|_, handler| handler != conn);

        // Calls this connection was serving fail with `transport`; calls
        // it made are simply dropped (nobody is listening for them).
        let affected: Vec<CallId> = self
            .pending
            .iter()
            .filter(|e| e.handler == *conn || e.caller == *conn)
            .map(|e| e.key().clone())
            .collect();

        for call_id in affected {
            if let Some((_, pend)) = self.pending.remove(&call_id) {
                if pend.handler == *conn && pend.caller != *conn {
                    counter!(RPC_CALLS_TOTAL, "outcome" => "transport").increment(1);
                    self.answer(hub, &pend.account_id, &pend.caller, ServerFrame::RpcError {
                        call_id,
                        reason: RpcFailure::Transport,
                    })
                    .await;
                }
            }
        }
    }

    async fn answer(
        &self,
        hub: &Arc<Hub>,
        account_id: &str,
        caller: &ConnectionId,
        frame: ServerFrame,
    ) {
        if let Some(conn) = hub.get(account_id, caller).await {
            let _ = conn.send(&frame);
        }
    }

    /// Number of in-flight calls (diagnostics).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RpcBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::ClientConnection;
    use tokio::sync::mpsc;

    async fn add_conn(
        hub: &Arc<Hub>,
        id: &str,
        account: &str,
        scope: Scope,
    ) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::from(id),
            account.into(),
            scope,
            tx,
        ));
        hub.add(conn).await;
        rx
    }

    fn parse(raw: &str) -> ServerFrame {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn call_without_handler_fails_fast() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c1"),
                Scope::session("s-1"),
                "session.readFile".into(),
                5_000,
                "req".into(),
            )
            .await;

        let frame = parse(&caller_rx.try_recv().unwrap());
        assert_eq!(
            frame,
            ServerFrame::RpcError {
                call_id: CallId::from("c1"),
                reason: RpcFailure::NoHandler
            }
        );
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_routes_to_most_recent_handler() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let mut old_rx = add_conn(&hub, "old", "acct", scope.clone()).await;
        let mut new_rx = add_conn(&hub, "new", "acct", scope.clone()).await;
        let _caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        broker.register("acct", &scope, "m", ConnectionId::from("old"));
        broker.register("acct", &scope, "m", ConnectionId::from("new"));

        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c2"),
                scope,
                "m".into(),
                5_000,
                "req".into(),
            )
            .await;

        assert!(old_rx.try_recv().is_err(), "old handler must not get the call");
        let frame = parse(&new_rx.try_recv().unwrap());
        assert!(matches!(frame, ServerFrame::RpcCall { .. }));
    }

    #[tokio::test]
    async fn response_reaches_caller() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let mut handler_rx = add_conn(&hub, "handler", "acct", scope.clone()).await;
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        broker.register("acct", &scope, "m", ConnectionId::from("handler"));
        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c3"),
                scope,
                "m".into(),
                5_000,
                "req".into(),
            )
            .await;
        let _ = handler_rx.try_recv().unwrap(); // forwarded call

        broker
            .on_response(
                &hub,
                &ConnectionId::from("handler"),
                CallId::from("c3"),
                true,
                Some("resp".into()),
                None,
            )
            .await;

        let frame = parse(&caller_rx.try_recv().unwrap());
        match frame {
            ServerFrame::RpcResponse { call_id, ok, response, .. } => {
                assert_eq!(call_id, CallId::from("c3"));
                assert!(ok);
                assert_eq!(response.as_deref(), Some("resp"));
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_from_stranger_is_discarded() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let _handler_rx = add_conn(&hub, "handler", "acct", scope.clone()).await;
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;
        let _stranger_rx = add_conn(&hub, "stranger", "acct", scope.clone()).await;

        broker.register("acct", &scope, "m", ConnectionId::from("handler"));
        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c4"),
                scope,
                "m".into(),
                5_000,
                "req".into(),
            )
            .await;

        broker
            .on_response(
                &hub,
                &ConnectionId::from("stranger"),
                CallId::from("c4"),
                true,
                Some("forged".into()),
                None,
            )
            .await;

        assert!(caller_rx.try_recv().is_err(), "forged response must not arrive");
        assert_eq!(broker.pending_count(), 1, "call still pending");
    }

    #[tokio::test]
    async fn timeout_synthesizes_error() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let mut handler_rx = add_conn(&hub, "handler", "acct", scope.clone()).await;
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        broker.register("acct", &scope, "m", ConnectionId::from("handler"));
        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c5"),
                scope,
                "m".into(),
                30, // very short budget
                "req".into(),
            )
            .await;
        let _ = handler_rx.try_recv().unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let frame = parse(&caller_rx.try_recv().unwrap());
        assert_eq!(
            frame,
            ServerFrame::RpcError {
                call_id: CallId::from("c5"),
                reason: RpcFailure::Timeout
            }
        );
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn handler_disconnect_fails_pending_calls() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let _handler_rx = add_conn(&hub, "handler", "acct", scope.clone()).await;
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        broker.register("acct", &scope, "m", ConnectionId::from("handler"));
        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c6"),
                scope.clone(),
                "m".into(),
                60_000,
                "req".into(),
            )
            .await;

        broker
            .connection_closed(&hub, &ConnectionId::from("handler"))
            .await;

        let frame = parse(&caller_rx.try_recv().unwrap());
        assert_eq!(
            frame,
            ServerFrame::RpcError {
                call_id: CallId::from("c6"),
                reason: RpcFailure::Transport
            }
        );
        // Registration is gone too: the next call is no-handler.
        assert!(broker.handler_for("acct", &scope, "m").is_none());
    }

    #[tokio::test]
    async fn stale_registration_resolves_to_no_handler() {
        let hub = Arc::new(Hub::new());
        let broker = Arc::new(RpcBroker::new());
        let scope = Scope::session("s-1");
        let mut caller_rx = add_conn(&hub, "caller", "acct", Scope::account("acct")).await;

        // Registered but never admitted to the hub (socket already gone).
        broker.register("acct", &scope, "m", ConnectionId::from("ghost"));
        broker
            .call(
                &hub,
                "acct",
                &ConnectionId::from("caller"),
                CallId::from("c7"),
                scope.clone(),
                "m".into(),
                5_000,
                "req".into(),
            )
            .await;

        let frame = parse(&caller_rx.try_recv().unwrap());
        assert!(matches!(
            frame,
            ServerFrame::RpcError {
                reason: RpcFailure::NoHandler,
                ..
            }
        ));
        assert!(broker.handler_for("acct", &scope, "m").is_none());
    }
}
