//! In-memory event publisher with bounded per-subscriber buffers.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{Event, Publisher, Subscription, SubscriptionId, GLOBAL_TASK_ID};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: SubscriptionId,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Fan-out publisher backed by bounded tokio channels.
///
/// Publishing never waits on a subscriber: when a subscriber's buffer is
/// full the event is dropped for that subscriber only.
pub struct EventBus {
    buffer_size: usize,
    registry: Mutex<Registry>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Number of live subscriptions for a task.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.registry
            .lock()
            .subscribers
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of task IDs (including the wildcard) with at least one subscriber.
    pub fn task_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }
}

impl Publisher for EventBus {
    fn publish(&self, event: Event) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }

        let mut keys = vec![event.task_id.clone()];
        if event.task_id != GLOBAL_TASK_ID {
            keys.push(GLOBAL_TASK_ID.to_string());
        }

        for key in keys {
            let Some(subs) = registry.subscribers.get_mut(&key) else {
                continue;
            };
            subs.retain(|sub| match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        task_id = %event.task_id,
                        subscription = sub.id,
                        event_type = %event.event_type(),
                        "subscriber buffer full, dropping event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if subs.is_empty() {
                registry.subscribers.remove(&key);
            }
        }
    }

    fn subscribe(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let mut registry = self.registry.lock();

        registry.next_id += 1;
        let id = registry.next_id;

        if registry.closed {
            // Dropping tx hands back an already-closed subscription.
            drop(tx);
        } else {
            registry
                .subscribers
                .entry(task_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
            tracing::debug!(task_id, subscription = id, "subscribed");
        }

        Subscription::new(id, task_id.to_string(), rx)
    }

    fn unsubscribe(&self, task_id: &str, subscription: &Subscription) {
        let mut registry = self.registry.lock();
        if let Some(subs) = registry.subscribers.get_mut(task_id) {
            subs.retain(|sub| sub.id != subscription.id());
            if subs.is_empty() {
                registry.subscribers.remove(task_id);
            }
        }
    }

    fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn updated(task_id: &str) -> Event {
        Event::new(task_id, EventPayload::TaskUpdated)
    }

    #[tokio::test]
    async fn delivers_to_task_and_wildcard_subscribers() {
        let bus = EventBus::new(8);
        let mut task_sub = bus.subscribe("TASK-001");
        let mut other_sub = bus.subscribe("TASK-002");
        let mut all_sub = bus.subscribe(GLOBAL_TASK_ID);

        bus.publish(updated("TASK-001"));

        assert_eq!(task_sub.recv().await.unwrap().task_id, "TASK-001");
        assert_eq!(all_sub.recv().await.unwrap().task_id, "TASK-001");
        assert!(other_sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_event_is_delivered_once_to_wildcard() {
        let bus = EventBus::new(8);
        let mut all_sub = bus.subscribe(GLOBAL_TASK_ID);

        bus.publish(Event::heartbeat());

        assert!(all_sub.recv().await.is_some());
        assert!(all_sub.try_recv().is_err());
    }

    #[test]
    fn full_buffer_drops_without_blocking() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe("TASK-001");

        for _ in 0..5 {
            bus.publish(updated("TASK-001"));
        }

        assert!(sub.try_recv().is_ok());
        assert!(sub.try_recv().is_ok());
        assert!(sub.try_recv().is_err());
        assert_eq!(bus.subscriber_count("TASK-001"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel_and_is_idempotent() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("TASK-001");
        assert_eq!(bus.subscriber_count("TASK-001"), 1);
        assert_eq!(bus.task_count(), 1);

        bus.unsubscribe("TASK-001", &sub);
        bus.unsubscribe("TASK-001", &sub);

        assert_eq!(bus.subscriber_count("TASK-001"), 0);
        assert_eq!(bus.task_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_ends_all_subscriptions() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe("TASK-001");
        let mut b = bus.subscribe(GLOBAL_TASK_ID);

        bus.close();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(bus.is_closed());

        // Publishing after close is a no-op.
        bus.publish(updated("TASK-001"));
    }

    #[tokio::test]
    async fn subscribe_after_close_returns_closed_subscription() {
        let bus = EventBus::new(8);
        bus.close();

        let mut sub = bus.subscribe("TASK-001");
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.task_count(), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("TASK-001");
        drop(sub);

        bus.publish(updated("TASK-001"));
        assert_eq!(bus.subscriber_count("TASK-001"), 0);
    }
}
