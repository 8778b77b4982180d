use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use taskhive_protocol::Event;

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 100;

pub type SubscriberId = u64;

/// Receiving half handed to a subscriber. Dropping it unsubscribes lazily on
/// the next publish.
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<Event>,
}

/// Best-effort fan-out of coordinator events.
///
/// Every subscriber gets its own bounded queue. Publishing never waits: a
/// subscriber whose queue is full is disconnected.
pub struct EventBroker {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
    next_id: SubscriberId,
    capacity: usize,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&mut self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        debug!(subscriber = id, "event subscriber added");
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `event` to every subscriber. Returns how many received it.
    pub fn publish(&mut self, event: Event) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = *id, "event queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "event subscriber went away");
                false
            }
        });
        delivered
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use taskhive_protocol::EventKind;

    use super::*;

    fn created(n: usize) -> Event {
        Event::now(EventKind::TaskCreated {
            task_id: format!("task-{n:03}"),
            title: "t".to_string(),
            parent_id: None,
        })
    }

    #[tokio::test]
    async fn subscribe_publish_unsubscribe_cycle() {
        let mut broker = EventBroker::new(8);
        let mut sub = broker.subscribe();

        assert_eq!(broker.publish(created(1)), 1);
        let evt = sub.events.recv().await.expect("recv");
        assert!(matches!(evt.kind, EventKind::TaskCreated { .. }));

        assert!(broker.unsubscribe(sub.id));
        assert!(!broker.unsubscribe(sub.id));
        assert_eq!(broker.publish(created(2)), 0);
    }

    #[test]
    fn full_queue_drops_only_that_subscriber() {
        let mut broker = EventBroker::new(2);
        let _slow = broker.subscribe();
        let mut fast = broker.subscribe();

        for n in 0..2 {
            assert_eq!(broker.publish(created(n)), 2);
            fast.events.try_recv().expect("fast subscriber keeps up");
        }

        assert_eq!(broker.publish(created(3)), 1);
        assert_eq!(broker.subscriber_count(), 1);
        assert!(fast.events.try_recv().is_ok());
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let mut broker = EventBroker::default();
        let sub = broker.subscribe();
        drop(sub);
        assert_eq!(broker.publish(created(1)), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
