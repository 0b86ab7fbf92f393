//! `RelayServer` — Axum HTTP + WebSocket server.
//!
//! The socket carries the sync protocol; a small HTTP surface serves the
//! credential handshake and the snapshot fetches clients need after
//! `resync-required`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, instrument, warn};

use happy_store::{AccountRow, RelayStore};

use crate::config::RelayConfig;
use crate::health::{self, HealthResponse};
use crate::presence::PresenceTracker;
use crate::rpc::RpcBroker;
use crate::shutdown::ShutdownCoordinator;
use crate::ws::hub::Hub;
use crate::ws::session::{run_ws_session, WsDeps};

/// Generates UUIDv7 request IDs.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        axum::http::HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Socket task dependencies.
    pub deps: Arc<WsDeps>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus metrics handle for rendering.
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    deps: Arc<WsDeps>,
    metrics_handle: Arc<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server over an opened store.
    pub fn new(
        config: RelayConfig,
        store: Arc<RelayStore>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            hub.clone(),
            Duration::from_secs(config.machine_offline_grace_secs),
        ));
        let deps = Arc::new(WsDeps {
            config,
            store,
            hub,
            broker: Arc::new(RpcBroker::new()),
            presence,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        });
        Self {
            deps,
            metrics_handle: Arc::new(metrics_handle),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        let state = AppState {
            deps: self.deps.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_upgrade_handler))
            .route("/v1/auth", post(auth_handshake_handler))
            .route("/v1/account", get(account_snapshot_handler))
            .route("/v1/sessions", post(create_session_handler))
            .route("/v1/sessions/{id}/messages", get(session_messages_handler))
            .with_state(state)
            // Outermost layers execute first on request, last on response.
            .layer(CatchPanicLayer::new())
            .layer(CompressionLayer::new())
            .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MB
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(30),
            ))
            .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
    }

    /// Bind to a TCP port and start serving. Returns the bound address
    /// and a join handle for the server task.
    #[instrument(skip_all, fields(host = %self.deps.config.host, port = self.deps.config.port))]
    pub async fn listen(&self) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!("{}:{}", self.deps.config.host, self.deps.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "relay started");

        // Retention sweep: prune each account's update log periodically.
        if self.deps.config.update_retention > 0 {
            let store = self.deps.store.clone();
            let retain = self.deps.config.update_retention;
            let token = self.deps.shutdown.token();
            self.deps.shutdown.register_task(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match store.account_ids() {
                                Ok(ids) => {
                                    for id in ids {
                                        if let Err(e) = store.prune_updates(&id, retain) {
                                            warn!(account_id = %id, error = %e, "retention sweep failed");
                                        }
                                    }
                                }
                                Err(e) => warn!(error = %e, "retention sweep could not list accounts"),
                            }
                        }
                        () = token.cancelled() => break,
                    }
                }
            }));
        }

        let router = self.router();
        let shutdown_token = self.deps.shutdown.token();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    info!("relay shutdown initiated");
                })
                .await;
            info!("relay shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    /// Get the fan-out hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.deps.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.deps.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.deps.config
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<RelayStore> {
        &self.deps.store
    }
}

/// Resolve the bearer token in `Authorization` to an account.
fn bearer_account(state: &AppState, headers: &HeaderMap) -> Result<AccountRow, StatusCode> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    state
        .deps
        .store
        .account_by_token(token)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.deps.hub.connection_count().await;
    let active_sessions = state.deps.store.running_session_count().unwrap_or(0);
    Json(health::health_check(state.start_time, connections, active_sessions))
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /ws — WebSocket upgrade handler.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let current = state.deps.hub.connection_count().await;
    if current >= state.deps.config.max_connections {
        warn!(
            current,
            max = state.deps.config.max_connections,
            "connection limit reached, rejecting WebSocket upgrade"
        );
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let deps = state.deps.clone();
    let max_message_size = deps.config.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, deps)))
}

#[derive(Deserialize)]
struct AuthHandshakeBody {
    token: String,
}

/// POST /v1/auth — credential handshake.
///
/// Resolves a bearer token to its account, provisioning one on first
/// sight. The socket's `auth` frame only accepts tokens that already
/// resolve, so clients run this once before their first connection.
async fn auth_handshake_handler(
    State(state): State<AppState>,
    Json(body): Json<AuthHandshakeBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if body.token.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let existing = state
        .deps
        .store
        .account_by_token(&body.token)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let (account, created) = match existing {
        Some(account) => (account, false),
        None => {
            let account = state
                .deps
                .store
                .create_account(&body.token)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            (account, true)
        }
    };
    Ok(Json(serde_json::json!({
        "accountId": account.id,
        "created": created,
    })))
}

/// GET /v1/account — entity heads for a full resync.
async fn account_snapshot_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account = bearer_account(&state, &headers)?;
    let sessions = state
        .deps
        .store
        .list_sessions(&account.id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let machines = state
        .deps
        .store
        .list_machines(&account.id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "accountId": account.id,
        "seq": account.last_seq,
        "version": account.version,
        "headBody": account.head_body,
        "sessions": sessions,
        "machines": machines,
    })))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    tag: String,
}

/// POST /v1/sessions — idempotent session creation by client tag.
async fn create_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account = bearer_account(&state, &headers)?;
    let session = state
        .deps
        .store
        .create_session(&account.id, &body.tag)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::to_value(session).unwrap_or_default()))
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    since: u64,
}

/// GET /v1/sessions/{id}/messages?since= — message log snapshot.
async fn session_messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account = bearer_account(&state, &headers)?;
    let session = state
        .deps
        .store
        .get_session(&account.id, &session_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let messages = state
        .deps
        .store
        .messages_since(&account.id, &session.id, query.since)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({
        "sessionId": session.id,
        "lifecycle": session.lifecycle,
        "lastMessageSeq": session.last_message_seq,
        "messages": messages,
    })))
}
