//! Per-session message pump.
//!
//! Single consumer (the child feeder), multiple producers (remote
//! messages, command handlers). Adjacent messages with identical mode
//! fingerprints coalesce into one batch; a fingerprint change forces a
//! boundary; `/clear` and `/compact` discard everything queued ahead of
//! them and are delivered alone.

use std::collections::VecDeque;
use std::sync::Arc;

use happy_core::entities::PermissionMode;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// The session mode a message was queued under. Messages queued under
/// the same fingerprint may be delivered to the assistant together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeFingerprint {
    /// Permission policy in effect.
    pub permission_mode: PermissionMode,
    /// Model override in effect.
    pub model: Option<String>,
    /// Allowed tool names.
    pub allowed_tools: Vec<String>,
    /// Disallowed tool names.
    pub disallowed_tools: Vec<String>,
    /// System prompt override.
    pub system_prompt: Option<String>,
}

/// One coalesced delivery to the assistant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Fingerprint shared by every message in the batch.
    pub fingerprint: ModeFingerprint,
    /// Message texts in arrival order.
    pub texts: Vec<String>,
}

/// What the consumer receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PumpItem {
    /// A batch of user messages.
    Batch(Batch),
    /// Clear-context command; everything queued before it was discarded.
    Clear,
    /// Compact command; everything queued before it was discarded.
    Compact,
}

enum Entry {
    Message { text: String, fingerprint: ModeFingerprint },
    Clear,
    Compact,
}

/// The pump. Cheap to clone via [`Arc`].
pub struct MessagePump {
    queue: Mutex<VecDeque<Entry>>,
    notify: Notify,
}

impl MessagePump {
    /// New empty pump.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Queue a user message under its current fingerprint.
    pub fn push_message(&self, text: impl Into<String>, fingerprint: ModeFingerprint) {
        self.queue.lock().push_back(Entry::Message {
            text: text.into(),
            fingerprint,
        });
        self.notify.notify_one();
    }

    /// Queue `/clear`, discarding everything ahead of it.
    pub fn push_clear(&self) {
        let mut queue = self.queue.lock();
        queue.clear();
        queue.push_back(Entry::Clear);
        drop(queue);
        self.notify.notify_one();
    }

    /// Queue `/compact`, discarding everything ahead of it.
    pub fn push_compact(&self) {
        let mut queue = self.queue.lock();
        queue.clear();
        queue.push_back(Entry::Compact);
        drop(queue);
        self.notify.notify_one();
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop everything (session teardown).
    pub fn drain(&self) {
        self.queue.lock().clear();
    }

    /// Take the next item without waiting.
    pub fn try_next(&self) -> Option<PumpItem> {
        let mut queue = self.queue.lock();
        match queue.pop_front()? {
            Entry::Clear => Some(PumpItem::Clear),
            Entry::Compact => Some(PumpItem::Compact),
            Entry::Message { text, fingerprint } => {
                let mut texts = vec![text];
                // Coalesce adjacent messages with the same fingerprint.
                while let Some(Entry::Message { fingerprint: next_fp, .. }) = queue.front() {
                    if *next_fp != fingerprint {
                        break;
                    }
                    let Some(Entry::Message { text, .. }) = queue.pop_front() else {
                        unreachable!("front was a message");
                    };
                    texts.push(text);
                }
                Some(PumpItem::Batch(Batch { fingerprint, texts }))
            }
        }
    }

    /// Wait for the next item (single consumer).
    pub async fn next(&self) -> PumpItem {
        loop {
            if let Some(item) = self.try_next() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}
