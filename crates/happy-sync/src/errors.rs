//! Sync client error type.

/// Failures surfaced to callers of the sync client.
///
/// Transient transport loss is NOT here — the client reconnects
/// internally and exposes a connected/disconnected observable instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The outbox is full and the mutation could not be coalesced onto
    /// an earlier pending update for the same entity.
    #[error("outbox full (backpressure)")]
    Backpressure,

    /// The rebase-and-retry budget was exhausted; the entity is in
    /// conflict and the caller must reconcile.
    #[error("state conflict after {attempts} rebases")]
    StateConflict {
        /// Attempts made.
        attempts: u32,
    },

    /// The credential was rejected; the caller must re-authenticate.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Server-supplied reason.
        reason: String,
    },

    /// An RPC had no registered handler.
    #[error("no handler for rpc")]
    NoHandler,

    /// An RPC timed out.
    #[error("rpc timed out")]
    Timeout,

    /// The peer vanished mid-call, or the call was attempted while
    /// disconnected.
    #[error("transport failure")]
    Transport,

    /// The remote handler returned an application error.
    #[error("handler error")]
    Handler {
        /// Decrypted error payload, if it decoded.
        body: Option<serde_json::Value>,
    },

    /// Encryption envelope failure.
    #[error("crypto: {0}")]
    Crypto(#[from] happy_crypto::CryptoError),

    /// Snapshot fetch over HTTP failed.
    #[error("snapshot fetch: {0}")]
    Snapshot(#[from] reqwest::Error),

    /// The client was shut down.
    #[error("client closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_terse() {
        assert_eq!(SyncError::Backpressure.to_string(), "outbox full (backpressure)");
        assert_eq!(
            SyncError::StateConflict { attempts: 5 }.to_string(),
            "state conflict after 5 rebases"
        );
    }
}
