//! Socket layer: connect, authenticate, split into typed halves.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use happy_core::protocol::{ClientFrame, ConnectionKind, ServerFrame};
use happy_core::{AccountId, ConnectionId};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::errors::SyncError;

/// The underlying WebSocket stream type.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half.
pub type WsSink = SplitSink<WsStream, Message>;
/// Read half.
pub type WsSource = SplitStream<WsStream>;

/// An authenticated socket.
pub struct AuthedSocket {
    /// Write half.
    pub sink: WsSink,
    /// Read half.
    pub source: WsSource,
    /// Server-assigned connection id (self-echo suppression key).
    pub connection_id: ConnectionId,
    /// Resolved account.
    pub account_id: AccountId,
}

/// Derive the socket URL from an HTTP(S) base URL.
pub fn ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_owned()
    };
    format!("{swapped}/ws")
}

/// Connect and run the auth handshake: the first frame out is `auth`,
/// the first frame back must be `auth-ok`.
pub async fn connect(
    server_url: &str,
    token: &str,
    kind: ConnectionKind,
    scope_ref: Option<&str>,
) -> Result<AuthedSocket, SyncError> {
    let url = ws_url(server_url);
    debug!(url, "connecting");
    let (stream, _resp) = connect_async(url.as_str())
        .await
        .map_err(|_| SyncError::Transport)?;
    let (mut sink, mut source) = stream.split();

    let auth = ClientFrame::Auth {
        token: token.to_owned(),
        connection_kind: kind,
        scope_ref: scope_ref.map(str::to_owned),
    };
    let json = serde_json::to_string(&auth).map_err(|_| SyncError::Transport)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|_| SyncError::Transport)?;

    // First frame back decides the connection's fate.
    loop {
        let msg = match source.next().await {
            Some(Ok(m)) => m,
            _ => return Err(SyncError::Transport),
        };
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(SyncError::Transport),
        };
        return match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::AuthOk {
                connection_id,
                account_id,
                ..
            }) => Ok(AuthedSocket {
                sink,
                source,
                connection_id,
                account_id,
            }),
            Ok(ServerFrame::AuthReject { reason }) => Err(SyncError::Auth { reason }),
            _ => Err(SyncError::Transport),
        };
    }
}

/// Serialize and send one frame.
pub async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), SyncError> {
    let json = serde_json::to_string(frame).map_err(|_| SyncError::Transport)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|_| SyncError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme() {
        assert_eq!(ws_url("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/ws");
        assert_eq!(ws_url("https://relay.example"), "wss://relay.example/ws");
    }

    #[test]
    fn ws_url_strips_trailing_slash() {
        assert_eq!(ws_url("http://host:1/"), "ws://host:1/ws");
    }

    #[test]
    fn ws_url_passes_through_ws_scheme() {
        assert_eq!(ws_url("ws://host:1"), "ws://host:1/ws");
    }

    #[tokio::test]
    async fn connect_to_nothing_is_transport_error() {
        // Port 1 is never listening.
        let err = connect(
            "http://127.0.0.1:1",
            "tok",
            ConnectionKind::UserScoped,
            None,
        )
        .await;
        assert!(matches!(err, Err(SyncError::Transport)));
    }
}
