//! Pub/Sub Hub (spec C5): per-session multicast of structured `Event`s.
//!
//! Built on `tokio::sync::broadcast` per session — its bounded ring buffer
//! gives us "drop oldest, mark overflow" for free via `RecvError::Lagged`,
//! and a sender with zero receivers is exactly the "no subscribers left"
//! case we prune on. A slow subscriber never blocks a fast one because each
//! has its own receiver cursor into the same ring buffer.

use dashmap::DashMap;
use loom_core::types::{Event, SessionKey};
use tokio::sync::broadcast;

const PER_SESSION_BUFFER: usize = 256;

pub struct PubSubHub {
    channels: DashMap<SessionKey, broadcast::Sender<Event>>,
}

impl Default for PubSubHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a session's event stream. Detachment is implicit: drop
    /// the returned receiver.
    pub fn attach(&self, session_id: &SessionKey) -> broadcast::Receiver<Event> {
        self.channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(PER_SESSION_BUFFER).0)
            .subscribe()
    }

    /// Publish one event to a session's subscribers. Best-effort: if the
    /// channel exists but has no live receivers, the event is dropped and
    /// the channel is pruned.
    pub fn publish(&self, session_id: &SessionKey, event: Event) {
        let should_prune = match self.channels.get(session_id) {
            Some(sender) => sender.send(event).is_err(),
            None => return,
        };
        if should_prune {
            self.channels.remove(session_id);
        }
    }

    /// Publish to every session currently known to the hub.
    pub fn broadcast(&self, event: Event) {
        let mut dead = Vec::new();
        for entry in self.channels.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for key in dead {
            self.channels.remove(&key);
        }
    }

    /// Number of sessions with at least one live channel tracked. A channel
    /// with zero subscribers is pruned lazily on the next publish, so this
    /// can briefly overcount.
    pub fn tracked_sessions(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(session: &str) -> Event {
        Event::new(session, loom_core::types::EventKind::Status, json!({}))
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let hub = PubSubHub::new();
        let key = SessionKey::new("s1");
        let mut rx = hub.attach(&key);
        hub.publish(&key, event("s1"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.session_id, "s1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_silently() {
        let hub = PubSubHub::new();
        let key = SessionKey::new("s1");
        // No attach() call — publish should not panic.
        hub.publish(&key, event("s1"));
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_in_order() {
        let hub = PubSubHub::new();
        let key = SessionKey::new("s1");
        let mut a = hub.attach(&key);
        let mut b = hub.attach(&key);
        hub.publish(&key, event("s1"));
        hub.publish(&key, event("s1"));
        assert!(a.recv().await.is_ok());
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_others() {
        let hub = PubSubHub::new();
        let key = SessionKey::new("s1");
        let mut slow = hub.attach(&key);
        let mut fast = hub.attach(&key);
        for _ in 0..(PER_SESSION_BUFFER + 10) {
            hub.publish(&key, event("s1"));
        }
        // Fast subscriber drains fine.
        assert!(fast.recv().await.is_ok());
        // Slow subscriber, having never read, observes a lag marker rather
        // than blocking the publisher.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}
