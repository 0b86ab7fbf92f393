//! Local control IPC.
//!
//! The daemon listens on a random loopback port (recorded in the state
//! file together with a token); short-lived `happy` invocations connect,
//! present the token, and issue control RPCs as JSON lines — one request
//! object per line, one response object back.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::DaemonError;

/// Control methods the daemon serves.
pub const METHOD_SPAWN_SESSION: &str = "spawnSession";
/// List supervised sessions.
pub const METHOD_LIST_SESSIONS: &str = "listSessions";
/// Stop one session.
pub const METHOD_STOP_SESSION: &str = "stopSession";
/// Daemon status document.
pub const METHOD_STATUS: &str = "daemonStatus";
/// Graceful daemon shutdown.
pub const METHOD_SHUTDOWN: &str = "daemonShutdown";

/// One request line.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcRequest {
    /// Token from the state file.
    pub token: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(default)]
    pub params: Value,
}

/// One response line.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcResponse {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Async method handler installed by the daemon.
pub type IpcHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Serve the control socket until cancelled. One task per client; each
/// client may issue any number of request lines.
pub async fn serve(
    listener: TcpListener,
    token: String,
    handler: IpcHandler,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "ipc accept failed");
                    continue;
                }
            },
            () = cancel.cancelled() => return,
        };

        let token = token.clone();
        let handler = handler.clone();
        let cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = handle_client(stream, token, handler) => {}
                () = cancel.cancelled() => {}
            }
        });
    }
}

async fn handle_client(stream: TcpStream, token: String, handler: IpcHandler) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) if request.token == token => {
                debug!(method = %request.method, "ipc request");
                match handler(request.method, request.params).await {
                    Ok(result) => IpcResponse {
                        ok: true,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => IpcResponse {
                        ok: false,
                        result: None,
                        error: Some(error),
                    },
                }
            }
            Ok(_) => IpcResponse {
                ok: false,
                result: None,
                error: Some("invalid token".into()),
            },
            Err(e) => IpcResponse {
                ok: false,
                result: None,
                error: Some(format!("malformed request: {e}")),
            },
        };

        let Ok(mut json) = serde_json::to_string(&response) else {
            break;
        };
        json.push('\n');
        if write.write_all(json.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// One-shot client call against a running daemon's control socket.
pub async fn call(
    port: u16,
    token: &str,
    method: &str,
    params: Value,
) -> Result<Value, DaemonError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|_| DaemonError::NotRunning)?;
    let (read, mut write) = stream.into_split();

    let request = IpcRequest {
        token: token.to_owned(),
        method: method.to_owned(),
        params,
    };
    let mut json = serde_json::to_string(&request)?;
    json.push('\n');
    write.write_all(json.as_bytes()).await?;

    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| DaemonError::Ipc("connection closed".into()))?;
    let response: IpcResponse = serde_json::from_str(&line)?;
    if response.ok {
        Ok(response.result.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Ipc(
            response.error.unwrap_or_else(|| "unknown error".into()),
        ))
    }
}
