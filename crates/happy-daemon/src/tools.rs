//! Tool-extension server: loopback HTTP tools the assistant can call.
//!
//! Read file, write file, list files, bash — all confined to the
//! session's working directory. Paths that resolve outside it are
//! refused.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::DaemonError;
use crate::shell;

#[derive(Clone)]
struct ToolState {
    working_dir: PathBuf,
    shell_timeout: Duration,
}

/// A running tool-extension server.
pub struct ToolServer {
    /// Bound loopback address.
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ToolServer {
    /// Bind on a random loopback port and start serving.
    pub async fn start(working_dir: PathBuf, shell_timeout: Duration) -> Result<Self, DaemonError> {
        let state = ToolState {
            working_dir,
            shell_timeout,
        };
        let app = Router::new()
            .route("/tools/read-file", post(read_file_handler))
            .route("/tools/write-file", post(write_file_handler))
            .route("/tools/list-files", post(list_files_handler))
            .route("/tools/bash", post(bash_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        info!(%addr, "tool server listening");

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

impl Drop for ToolServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolve `path` inside the working directory, refusing escapes.
fn resolve_in_workdir(working_dir: &Path, path: &str) -> Result<PathBuf, StatusCode> {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        working_dir.join(path)
    };
    // Canonicalize the nearest existing ancestor so new files still
    // validate.
    let check = joined.parent().unwrap_or(&joined);
    let canonical_parent = check
        .canonicalize()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let canonical_root = working_dir
        .canonicalize()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !canonical_parent.starts_with(&canonical_root) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(joined)
}

#[derive(Deserialize)]
struct PathBody {
    path: String,
}

async fn read_file_handler(
    State(state): State<ToolState>,
    Json(body): Json<PathBody>,
) -> Result<Json<Value>, StatusCode> {
    let path = resolve_in_workdir(&state.working_dir, &body.path)?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(json!({"content": content})))
}

#[derive(Deserialize)]
struct WriteBody {
    path: String,
    content: String,
}

async fn write_file_handler(
    State(state): State<ToolState>,
    Json(body): Json<WriteBody>,
) -> Result<Json<Value>, StatusCode> {
    let path = resolve_in_workdir(&state.working_dir, &body.path)?;
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    tokio::fs::write(&path, body.content)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct ListBody {
    #[serde(default)]
    path: Option<String>,
}

async fn list_files_handler(
    State(state): State<ToolState>,
    Json(body): Json<ListBody>,
) -> Result<Json<Value>, StatusCode> {
    let dir = match &body.path {
        Some(p) => resolve_in_workdir(&state.working_dir, p)?,
        None => state.working_dir.clone(),
    };
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(&dir)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    while let Ok(Some(entry)) = reader.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(json!({"name": name, "isDir": is_dir}));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(Json(json!({"entries": entries})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BashBody {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn bash_handler(
    State(state): State<ToolState>,
    Json(body): Json<BashBody>,
) -> Json<Value> {
    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.shell_timeout)
        .min(Duration::from_secs(600));
    let result = shell::run_shell(&body.command, &state.working_dir, timeout).await;
    Json(json!({
        "output": result.output,
        "exitCode": result.exit_code,
        "timedOut": result.timed_out,
    }))
}
