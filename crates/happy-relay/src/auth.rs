//! Connection authentication and scope authorization.
//!
//! A bearer token resolves to exactly one account; everything a
//! connection may publish to or subscribe to must be owned by that
//! account. Unauthorized scope requests are refused, never created.

use std::sync::Arc;

use happy_core::entities::{Scope, ScopeKind};
use happy_core::protocol::ConnectionKind;
use happy_store::{RelayStore, StoreError};

/// Outcome of authenticating a socket's first frame.
#[derive(Clone, Debug)]
pub struct AuthedConnection {
    /// Resolved account id.
    pub account_id: String,
    /// The scope this connection is auto-subscribed to.
    pub auto_scope: Scope,
}

/// Why authentication failed. The reason string sent to the client never
/// echoes the credential.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Token did not resolve to an account.
    #[error("invalid token")]
    InvalidToken,
    /// `scopeRef` missing for a scoped connection kind.
    #[error("missing scopeRef for scoped connection")]
    MissingScopeRef,
    /// Scope not owned by the account.
    #[error("scope not owned by account")]
    ScopeNotOwned,
    /// Store failure during auth.
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Authenticate a connection's `auth` frame.
///
/// For `session-scoped` kinds the session must already exist (sessions
/// are created over the HTTP surface); for `machine-scoped` kinds the
/// machine row is created on first connect — that is the daemon's first
/// boot.
pub fn authenticate(
    store: &Arc<RelayStore>,
    token: &str,
    kind: ConnectionKind,
    scope_ref: Option<&str>,
) -> Result<AuthedConnection, AuthError> {
    let account = store
        .account_by_token(token)?
        .ok_or(AuthError::InvalidToken)?;

    let auto_scope = match kind {
        ConnectionKind::UserScoped => Scope::account(&account.id),
        ConnectionKind::SessionScoped => {
            let session_id = scope_ref.ok_or(AuthError::MissingScopeRef)?;
            let session = store
                .get_session(&account.id, session_id)?
                .ok_or(AuthError::ScopeNotOwned)?;
            Scope::session(session.id)
        }
        ConnectionKind::MachineScoped => {
            let machine_id = scope_ref.ok_or(AuthError::MissingScopeRef)?;
            let machine = store.get_or_create_machine(&account.id, machine_id)?;
            Scope::machine(machine.id)
        }
    };

    Ok(AuthedConnection {
        account_id: account.id,
        auto_scope,
    })
}

/// Check that an already-authenticated connection may subscribe to (or
/// target) a scope.
pub fn authorize_scope(
    store: &Arc<RelayStore>,
    account_id: &str,
    scope: &Scope,
) -> Result<(), AuthError> {
    match scope.kind {
        ScopeKind::Account => {
            if scope.id == account_id {
                Ok(())
            } else {
                Err(AuthError::ScopeNotOwned)
            }
        }
        ScopeKind::Session => {
            let _ = store
                .get_session(account_id, &scope.id)?
                .ok_or(AuthError::ScopeNotOwned)?;
            Ok(())
        }
        ScopeKind::Machine => {
            // Machines are created by their daemon's first connection;
            // a subscription to an unknown machine is a read of a row
            // that doesn't exist yet.
            let machines = store.list_machines(account_id)?;
            if machines.iter().any(|m| m.id == scope.id) {
                Ok(())
            } else {
                Err(AuthError::ScopeNotOwned)
            }
        }
    }
}
