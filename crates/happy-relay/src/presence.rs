//! Machine presence: online / offline / shutdown transitions.
//!
//! A machine is `online` while its daemon's machine-scoped socket is
//! connected. When the last such socket drops, a grace timer starts; if
//! the daemon has not reconnected when it fires, the machine flips to
//! `offline` and the transition is published as a persistent update so
//! every client observes it. A graceful daemon exit publishes `shutdown`
//! itself, which the grace timer must not overwrite.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use happy_core::entities::MachineStatus;
use happy_store::{PublishOutcome, RelayStore};
use tracing::{debug, warn};

use crate::ws::hub::Hub;

/// Tracks machine-scoped connections and drives status transitions.
pub struct PresenceTracker {
    store: Arc<RelayStore>,
    hub: Arc<Hub>,
    grace: Duration,
    /// (account, machine) → generation. Bumped on every connect or
    /// disconnect; a stale grace timer observes a newer generation and
    /// does nothing.
    generations: DashMap<(String, String), u64>,
}

impl PresenceTracker {
    /// Create a tracker.
    pub fn new(store: Arc<RelayStore>, hub: Arc<Hub>, grace: Duration) -> Self {
        Self {
            store,
            hub,
            grace,
            generations: DashMap::new(),
        }
    }

    fn bump(&self, account_id: &str, machine_id: &str) -> u64 {
        let mut entry = self
            .generations
            .entry((account_id.to_owned(), machine_id.to_owned()))
            .or_insert(0);
        *entry += 1;
        *entry
    }

    fn current(&self, account_id: &str, machine_id: &str) -> u64 {
        self.generations
            .get(&(account_id.to_owned(), machine_id.to_owned()))
            .map(|g| *g)
            .unwrap_or(0)
    }

    /// A machine-scoped socket authenticated: mark online immediately.
    pub async fn machine_connected(&self, account_id: &str, machine_id: &str) {
        let _ = self.bump(account_id, machine_id);
        self.transition(account_id, machine_id, MachineStatus::Online)
            .await;
    }

    /// A machine-scoped socket closed: flip to offline after the grace
    /// period unless the daemon reconnects (or already said shutdown).
    pub fn machine_disconnected(self: &Arc<Self>, account_id: String, machine_id: String) {
        let generation = self.bump(&account_id, &machine_id);
        let tracker = Arc::clone(self);
        let _ = tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            if tracker.current(&account_id, &machine_id) != generation {
                // Daemon came back (or dropped again); a newer timer owns it.
                return;
            }
            // A graceful exit already wrote `shutdown`; only a live
            // machine decays to offline.
            match tracker.store.get_or_create_machine(&account_id, &machine_id) {
                Ok(row) if row.status == MachineStatus::Online => {
                    tracker
                        .transition(&account_id, &machine_id, MachineStatus::Offline)
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(machine_id, error = %e, "presence lookup failed"),
            }
        });
    }

    async fn transition(&self, account_id: &str, machine_id: &str, status: MachineStatus) {
        match self.store.set_machine_status(account_id, machine_id, status) {
            Ok(PublishOutcome::Committed { update }) => {
                debug!(machine_id, ?status, seq = update.seq, "machine presence transition");
                self.hub.fan_out_update(&update, None).await;
            }
            Ok(_) => {} // already in that state
            Err(e) => warn!(machine_id, ?status, error = %e, "presence transition failed"),
        }
    }
}
