//! In-process event bus.
//!
//! Topic-filtered publish-subscribe with bounded per-subscriber buffers.
//! Delivery is FIFO per publisher. Publishing never suspends and never
//! blocks on a slow subscriber: a full buffer drops the subscriber with
//! `SlowConsumer`. Events are never persisted and never replayed — a
//! reconnecting client starts from the live stream.

use dashmap::DashMap;
use openclaw_types::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber buffer size: the high-water mark before a drop.
pub const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty()
            || self.topics.iter().any(|filter| {
                filter == "*"
                    || filter == topic
                    || filter
                        .strip_suffix(".*")
                        .is_some_and(|prefix| {
                            topic.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.'))
                        })
            })
    }
}

/// A live subscription; dropping the receiver ends it.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

/// The bus.
pub struct EventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with topic filters. Filters are exact topics, `prefix.*`
    /// patterns, or `*`; an empty list means everything.
    pub fn subscribe(&self, topics: &[String]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(
            id,
            Subscriber {
                topics: topics.to_vec(),
                tx,
            },
        );
        debug!(subscriber = id, ?topics, "bus subscription added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Publish to all matching subscribers. Synchronous and non-blocking:
    /// a subscriber whose buffer is full is dropped, not waited on.
    pub fn publish(&self, event: Event) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().wants(&event.topic) {
                continue;
            }
            match entry.value().tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = entry.key(), topic = %event.topic, "slow consumer — dropping subscriber");
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*entry.key());
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_types::event::EventPayload;
    use openclaw_types::session::{StopReason, TokenUsage};

    fn message_end() -> Event {
        Event::new(EventPayload::ChatMessageEnd {
            session_key: "agent:main:telegram:dm:u1".parse().unwrap(),
            stop_reason: StopReason::EndTurn,
            tokens: TokenUsage::default(),
        })
    }

    fn ops_error() -> Event {
        Event::new(EventPayload::OpsError {
            kind: "over_budget".into(),
            message: "m".into(),
            session_key: None,
        })
    }

    #[tokio::test]
    async fn test_exact_topic_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&["chat.message_end".to_string()]);
        bus.publish(ops_error());
        bus.publish(message_end());
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.topic, "chat.message_end");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prefix_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&["chat.*".to_string()]);
        bus.publish(message_end());
        bus.publish(ops_error());
        assert_eq!(sub.rx.recv().await.unwrap().topic, "chat.message_end");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_filter_receives_all() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        bus.publish(message_end());
        bus.publish(ops_error());
        assert_eq!(sub.rx.recv().await.unwrap().topic, "chat.message_end");
        assert_eq!(sub.rx.recv().await.unwrap().topic, "ops.error");
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&[]);
        for _ in 0..10 {
            bus.publish(message_end());
            bus.publish(ops_error());
        }
        for _ in 0..10 {
            assert_eq!(sub.rx.recv().await.unwrap().topic, "chat.message_end");
            assert_eq!(sub.rx.recv().await.unwrap().topic, "ops.error");
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[]);
        // Never drain; overflow the buffer.
        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(message_end());
        }
        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn test_publishers_unaffected_by_drop() {
        let bus = EventBus::new();
        let _slow = bus.subscribe(&[]);
        let mut healthy = bus.subscribe(&[]);
        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(message_end());
            // The healthy subscriber drains as it goes.
            let _ = healthy.rx.try_recv();
        }
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[]);
        bus.unsubscribe(sub.id);
        bus.publish(message_end());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_prefix_does_not_match_bare_prefix() {
        let sub = Subscriber {
            topics: vec!["chat.*".to_string()],
            tx: mpsc::channel(1).0,
        };
        assert!(sub.wants("chat.delta"));
        assert!(!sub.wants("chat"));
        assert!(!sub.wants("chatter.delta"));
    }
}
