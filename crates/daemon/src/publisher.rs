//! Status event fan-out.
//!
//! The [`StatusPublisher`] delivers every [`StatusEvent`] to every current
//! subscriber. Each subscriber owns an unbounded queue, so a slow reader
//! never holds up the session supervisors. Delivery happens under a single
//! lock, which gives all subscribers the same global order; subscribing
//! takes the same lock, so a new subscriber sees a contiguous suffix of the
//! stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use protocol::StatusEvent;
use tokio::sync::mpsc;

/// Identifier of a subscriber.
pub type SubscriberId = u64;

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl Subscription {
    /// The subscriber identifier, for [`StatusPublisher::unsubscribe`].
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event. Returns `None` after unsubscribing.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: SubscriberId,
    senders: HashMap<SubscriberId, mpsc::UnboundedSender<StatusEvent>>,
}

/// Ordered, lossless broadcaster of status events.
#[derive(Default)]
pub struct StatusPublisher {
    subscribers: Mutex<Subscribers>,
    /// Total events published.
    published: AtomicU64,
}

impl StatusPublisher {
    /// Creates a publisher with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.insert(id, tx);
        tracing::debug!(subscriber_id = id, "Added status subscriber");
        Subscription { id, rx }
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().senders.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber_id = id, "Removed status subscriber");
        }
        removed
    }

    /// Delivers `event` to every subscriber.
    ///
    /// Subscribers whose receiver was dropped are removed. Returns the
    /// number of subscribers the event was delivered to.
    pub fn publish(&self, event: StatusEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.lock();
        let mut delivered = 0;
        subscribers.senders.retain(|id, tx| match tx.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                tracing::debug!(subscriber_id = *id, "Removed closed status subscriber");
                false
            }
        });
        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    /// Total number of events published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::SessionState;
    use std::sync::Arc;

    fn state_event(profile_id: &str, state: SessionState) -> StatusEvent {
        StatusEvent::SessionStateChanged {
            profile_id: profile_id.to_string(),
            state,
            failure_reason: None,
            tunnel: None,
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = StatusPublisher::new();
        assert_eq!(publisher.publish(state_event("p", SessionState::Idle)), 0);
        assert_eq!(publisher.published_count(), 1);
    }

    #[tokio::test]
    async fn test_all_subscribers_receive_events_in_order() {
        let publisher = StatusPublisher::new();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        assert_ne!(a.id(), b.id());

        let states = [
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Disconnecting,
            SessionState::Idle,
        ];
        for state in states {
            assert_eq!(publisher.publish(state_event("p", state)), 2);
        }

        for sub in [&mut a, &mut b] {
            for state in states {
                assert_eq!(sub.recv().await, Some(state_event("p", state)));
            }
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_suffix() {
        let publisher = StatusPublisher::new();
        publisher.publish(state_event("p", SessionState::Connecting));

        let mut late = publisher.subscribe();
        publisher.publish(state_event("p", SessionState::Connected));

        assert_eq!(
            late.recv().await,
            Some(state_event("p", SessionState::Connected))
        );
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let publisher = StatusPublisher::new();
        let sub = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        assert!(publisher.unsubscribe(sub.id()));
        assert!(!publisher.unsubscribe(sub.id()));
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.publish(state_event("p", SessionState::Idle)), 0);
    }

    #[test]
    fn test_dropped_subscription_is_removed_on_publish() {
        let publisher = StatusPublisher::new();
        let keep = publisher.subscribe();
        let gone = publisher.subscribe();
        drop(gone);

        assert_eq!(publisher.publish(state_event("p", SessionState::Idle)), 1);
        assert_eq!(publisher.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_lose_events() {
        let publisher = StatusPublisher::new();
        let mut slow = publisher.subscribe();

        for i in 0..10_000u64 {
            publisher.publish(StatusEvent::LogLineReceived {
                profile_id: "p".to_string(),
                event: protocol::LogEvent {
                    seq: i,
                    timestamp: 0,
                    raw_line: String::new(),
                    kind: protocol::LogKind::Info,
                },
            });
        }

        for i in 0..10_000u64 {
            match slow.recv().await {
                Some(StatusEvent::LogLineReceived { event, .. }) => assert_eq!(event.seq, i),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_publishers_share_one_order() {
        let publisher = Arc::new(StatusPublisher::new());
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        let mut handles = Vec::new();
        for task in 0..4 {
            let publisher = Arc::clone(&publisher);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    publisher.publish(state_event(&format!("p{}", task), SessionState::Idle));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while let Some(e) = a.try_recv() {
            seen_a.push(e.profile_id().to_string());
        }
        while let Some(e) = b.try_recv() {
            seen_b.push(e.profile_id().to_string());
        }
        assert_eq!(seen_a.len(), 400);
        assert_eq!(seen_a, seen_b);
    }
}
