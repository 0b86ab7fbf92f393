//! Permission-request broker.
//!
//! When the assistant asks to run a tool, the CLI emits a structured
//! permission-request message into the session log and parks the child's
//! tool call on a oneshot. A remote client resolves it over RPC
//! (`processPermissionRequest`); sessions in plan mode with the
//! auto-approve bit resolve locally; expiry denies.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use happy_core::entities::PermissionMode;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// The decision for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Run the tool.
    Allow,
    /// Refuse the tool.
    Deny,
}

/// A permission request awaiting a decision, as published to the log.
#[derive(Clone, Debug)]
pub struct PermissionRequest {
    /// Correlates the eventual RPC decision.
    pub request_id: String,
    /// Tool the assistant wants to run.
    pub tool_name: String,
    /// Tool arguments.
    pub arguments: Value,
}

/// Broker state shared between the child feeder and the RPC handler.
pub struct PermissionBroker {
    pending: DashMap<String, oneshot::Sender<Decision>>,
    timeout: Duration,
    /// Auto-approve plan-mode tool calls without waiting.
    auto_approve_plan: bool,
}

impl PermissionBroker {
    /// New broker.
    pub fn new(timeout: Duration, auto_approve_plan: bool) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            timeout,
            auto_approve_plan,
        })
    }

    /// Open a request. Returns the request document (for the session
    /// log) and a future resolving to the decision.
    pub fn open(
        self: &Arc<Self>,
        tool_name: impl Into<String>,
        arguments: Value,
        mode: PermissionMode,
    ) -> (PermissionRequest, impl std::future::Future<Output = Decision>) {
        let request = PermissionRequest {
            request_id: Uuid::now_v7().to_string(),
            tool_name: tool_name.into(),
            arguments,
        };

        let auto = self.auto_approve_plan && mode == PermissionMode::Plan;
        let (tx, rx) = oneshot::channel();
        if auto {
            let _ = tx.send(Decision::Allow);
        } else {
            let _ = self.pending.insert(request.request_id.clone(), tx);
        }

        let broker = Arc::clone(self);
        let request_id = request.request_id.clone();
        let timeout = self.timeout;
        let decision = async move {
            let result = tokio::time::timeout(timeout, rx).await;
            let _ = broker.pending.remove(&request_id);
            match result {
                Ok(Ok(decision)) => decision,
                // Dropped sender or expiry: the default is deny.
                _ => Decision::Deny,
            }
        };
        (request, decision)
    }

    /// Resolve a request (the RPC path). Returns `false` for unknown or
    /// already-resolved ids.
    pub fn resolve(&self, request_id: &str, decision: Decision) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                debug!(request_id, ?decision, "permission resolved");
                tx.send(decision).is_ok()
            }
            None => false,
        }
    }

    /// Number of unresolved requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deny everything outstanding (session teardown).
    pub fn deny_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.resolve(&id, Decision::Deny);
        }
    }
}
