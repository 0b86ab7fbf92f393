//! Control-mode tracking: `local` (terminal owns input) vs `remote`
//! (phone drives, keyboard ignored).
//!
//! The bit lives in `agentState.controlledByUser` and every flip is
//! published as a persistent update, so all connected clients observe
//! the current mode within one round trip.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Who owns the session's input right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMode {
    /// Terminal-attached; keyboard input accepted.
    Local,
    /// Phone-driven; keyboard input ignored.
    Remote,
}

/// Shared, observable control mode.
pub struct ControlTracker {
    tx: watch::Sender<ControlMode>,
}

impl ControlTracker {
    /// New tracker starting in the given mode.
    pub fn new(initial: ControlMode) -> Arc<Self> {
        let (tx, _) = watch::channel(initial);
        Arc::new(Self { tx })
    }

    /// Current mode.
    pub fn mode(&self) -> ControlMode {
        *self.tx.borrow()
    }

    /// Observe flips.
    pub fn watch(&self) -> watch::Receiver<ControlMode> {
        self.tx.subscribe()
    }

    /// Flip to local (first keypress on the controlling terminal).
    /// Returns `true` if the mode changed.
    pub fn take_local(&self) -> bool {
        self.flip(ControlMode::Local)
    }

    /// Flip to remote (explicit remote command).
    /// Returns `true` if the mode changed.
    pub fn release_to_remote(&self) -> bool {
        self.flip(ControlMode::Remote)
    }

    fn flip(&self, to: ControlMode) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|mode| {
            if *mode == to {
                false
            } else {
                info!(?to, "control mode flipped");
                *mode = to;
                changed = true;
                true
            }
        });
        changed
    }
}

/// Watch the controlling terminal: any keypress while the session is
/// remote flips it to local. Runs until stdin closes.
pub async fn watch_terminal_keys(tracker: Arc<ControlTracker>) {
    use tokio::io::AsyncReadExt;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if tracker.mode() == ControlMode::Remote {
                    let _ = tracker.take_local();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_given_mode() {
        let tracker = ControlTracker::new(ControlMode::Remote);
        assert_eq!(tracker.mode(), ControlMode::Remote);
    }

    #[test]
    fn take_local_flips_once() {
        let tracker = ControlTracker::new(ControlMode::Remote);
        assert!(tracker.take_local());
        assert_eq!(tracker.mode(), ControlMode::Local);
        // Second keypress changes nothing
        assert!(!tracker.take_local());
    }

    #[test]
    fn release_returns_to_remote() {
        let tracker = ControlTracker::new(ControlMode::Local);
        assert!(tracker.release_to_remote());
        assert_eq!(tracker.mode(), ControlMode::Remote);
        assert!(!tracker.release_to_remote());
    }

    #[tokio::test]
    async fn watchers_observe_flips() {
        let tracker = ControlTracker::new(ControlMode::Remote);
        let mut rx = tracker.watch();
        assert_eq!(*rx.borrow(), ControlMode::Remote);

        let _ = tracker.take_local();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ControlMode::Local);
    }

    #[tokio::test]
    async fn no_notification_without_change() {
        let tracker = ControlTracker::new(ControlMode::Local);
        let mut rx = tracker.watch();
        let _ = rx.borrow_and_update();
        let _ = tracker.take_local(); // no-op
        assert!(!rx.has_changed().unwrap());
    }
}
