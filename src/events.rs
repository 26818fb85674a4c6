//! Publish/subscribe registry for DHT notifications.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::descriptor::PeerDescriptor;
use crate::protocol::RouteMessageWrapper;

/// Notifications emitted by a DHT node.
#[derive(Clone, Debug)]
pub enum DhtEvent {
    /// A peer entered the routing table.
    NewContact(PeerDescriptor),
    /// A peer left the routing table.
    ContactRemoved(PeerDescriptor),
    /// A routed message reached this node.
    Message(RouteMessageWrapper),
}

/// Fan-out registry with snapshot delivery.
///
/// `publish` clones the subscriber list before sending, so a subscriber added
/// while an event is being dispatched sees only later events and none are
/// delivered twice.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DhtEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DhtEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DhtEvent) {
        let snapshot = self.lock().clone();
        let mut closed = false;
        for subscriber in &snapshot {
            if subscriber.send(event.clone()).is_err() {
                closed = true;
            }
        }
        if closed {
            self.lock().retain(|s| !s.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<DhtEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_each_event_once() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(DhtEvent::NewContact(PeerDescriptor::new([1u8; 32])));

        for rx in [&mut first, &mut second] {
            match rx.recv().await {
                Some(DhtEvent::NewContact(p)) => assert_eq!(p.node_id, [1u8; 32]),
                other => panic!("unexpected event {other:?}"),
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);

        bus.publish(DhtEvent::ContactRemoved(PeerDescriptor::new([2u8; 32])));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
