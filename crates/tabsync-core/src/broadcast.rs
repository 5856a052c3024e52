//! Broadcast coordinator
//!
//! Best-effort pub/sub between sessions sharing a persistence key. Delivery
//! is at-most-once per publish and never echoes back to the publisher; a
//! sibling whose receiver has been dropped simply misses the message. The
//! sync client therefore reconciles from storage on its own schedule as well,
//! rather than relying solely on broadcasts.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::SessionId;

/// Messages exchanged between sessions sharing a persistence key.
///
/// The payloads are serde-serializable so a transport that crosses process
/// boundaries (local socket, named pipe) can carry them unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// The shared persisted state changed; siblings should reload and merge
    Changed,
    /// A session is shutting down
    Closing { session_id: SessionId },
}

struct Subscriber {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// In-process broadcast bus, scoped by persistence key.
#[derive(Default)]
pub struct BroadcastBus {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl BroadcastBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to messages for `key`.
    ///
    /// The returned receiver yields messages published by *other* sessions
    /// only; a session never receives its own publishes.
    pub fn subscribe(&self, key: &str, session_id: SessionId) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        topics
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { session_id, tx });
        rx
    }

    /// Remove a session's subscription for `key`.
    ///
    /// Safe to call when the session never subscribed.
    pub fn unsubscribe(&self, key: &str, session_id: SessionId) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(key) {
            subscribers.retain(|s| s.session_id != session_id);
            if subscribers.is_empty() {
                topics.remove(key);
            }
        }
    }

    /// Publish `message` to every other live session on `key`.
    ///
    /// Best-effort: send failures drop the stale subscriber and are not
    /// reported to the publisher.
    pub fn publish(&self, key: &str, sender: SessionId, message: BusMessage) {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(key) else {
            return;
        };

        subscribers.retain(|subscriber| {
            if subscriber.session_id == sender {
                return true;
            }
            match subscriber.tx.send(message.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(key, session_id = %subscriber.session_id, "dropping stale broadcast subscriber");
                    false
                }
            }
        });
    }

    /// Number of live subscribers on `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.topics.lock().get(key).map_or(0, |s| s.len())
    }
}
