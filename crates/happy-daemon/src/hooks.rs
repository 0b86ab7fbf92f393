//! Hook server: receives lifecycle callbacks from the assistant child.
//!
//! The assistant is pointed at this loopback HTTP service through a
//! generated hook-settings file; today the one hook that matters is the
//! session-id rotation (the assistant rolled its internal session file),
//! which the runtime needs to keep offline seeding working.

use std::net::SocketAddr;
use std::path::Path;

use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::DaemonError;

/// Events the hook server forwards to the session runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRotated {
    /// The assistant's previous internal session id, if it had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_session_id: Option<String>,
    /// The new internal session id.
    pub new_session_id: String,
}

#[derive(Clone)]
struct HookState {
    events: mpsc::Sender<SessionRotated>,
}

/// A running hook server.
pub struct HookServer {
    /// Bound loopback address.
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl HookServer {
    /// Bind on a random loopback port and start serving.
    pub async fn start(events: mpsc::Sender<SessionRotated>) -> Result<Self, DaemonError> {
        let state = HookState { events };
        let app = Router::new()
            .route("/hook/session-rotated", post(session_rotated_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!(%addr, "hook server listening");

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, handle })
    }

    /// Stop serving.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HookServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn session_rotated_handler(
    State(state): State<HookState>,
    Json(body): Json<SessionRotated>,
) -> Json<serde_json::Value> {
    debug!(new_session_id = %body.new_session_id, "session rotated hook");
    let _ = state.events.send(body).await;
    Json(serde_json::json!({"ok": true}))
}

/// Hook-settings document the assistant child reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSettings {
    /// Base URL of the hook server.
    pub hook_url: String,
    /// Base URL of the tool-extension server.
    pub tool_url: String,
}

/// Write the hook-settings file referenced by the child's environment.
pub fn write_hook_settings(
    path: &Path,
    hook_addr: SocketAddr,
    tool_addr: SocketAddr,
) -> Result<(), DaemonError> {
    let settings = HookSettings {
        hook_url: format!("http://{hook_addr}"),
        tool_url: format!("http://{tool_addr}"),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&settings)?)?;
    Ok(())
}
