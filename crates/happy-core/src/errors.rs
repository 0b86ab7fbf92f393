//! Error taxonomy shared across the workspace.
//!
//! Machine-readable code constants mirror the wire protocol; the
//! [`CoreError`] type covers failures that originate below any specific
//! component (encoding, clock, invariant breaks).

// ── Error code constants ────────────────────────────────────────────

/// Optimistic concurrency check failed.
pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
/// Credential invalid or expired.
pub const AUTH_FAILED: &str = "AUTH_FAILED";
/// Server-advised retry-later.
pub const RATE_LIMIT: &str = "RATE_LIMIT";
/// No handler registered for the RPC target.
pub const NO_HANDLER: &str = "NO_HANDLER";
/// RPC budget exhausted.
pub const TIMEOUT: &str = "TIMEOUT";
/// Peer vanished mid-call or socket failed.
pub const TRANSPORT: &str = "TRANSPORT";
/// Outbox full and the mutation could not be coalesced.
pub const BACKPRESSURE: &str = "BACKPRESSURE";
/// Subscription cursor fell below the retention horizon.
pub const RESYNC_REQUIRED: &str = "RESYNC_REQUIRED";
/// Rebase-and-retry budget exhausted.
pub const STATE_CONFLICT: &str = "STATE_CONFLICT";
/// Malformed frame or schema mismatch.
pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";

/// Failures below any specific component.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A frame or stored document failed to (de)serialize.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A protocol invariant was violated by a peer.
    #[error("protocol violation: {message}")]
    Protocol {
        /// What was malformed.
        message: String,
    },
}

impl CoreError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoding(_) => PROTOCOL_VIOLATION,
            Self::Protocol { .. } => PROTOCOL_VIOLATION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_code() {
        let err = CoreError::Protocol {
            message: "bad frame".into(),
        };
        assert_eq!(err.code(), PROTOCOL_VIOLATION);
        assert_eq!(err.to_string(), "protocol violation: bad frame");
    }

    #[test]
    fn encoding_error_wraps_serde() {
        let serde_err = serde_json::from_str::<u32>("not-a-number").unwrap_err();
        let err = CoreError::from(serde_err);
        assert_eq!(err.code(), PROTOCOL_VIOLATION);
    }
}
