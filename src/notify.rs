use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::PlanEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for reservation lifecycle events, one channel per queue.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<PlanEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a queue. Creates the channel if needed.
    pub fn subscribe(&self, queue: &str) -> broadcast::Receiver<PlanEvent> {
        let sender = self
            .channels
            .entry(queue.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event on its queue's channel. No-op if nobody is listening.
    pub fn send(&self, event: &PlanEvent) {
        if let Some(sender) = self.channels.get(event.queue()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a queue's plan is dropped).
    pub fn remove(&self, queue: &str) {
        self.channels.remove(queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationId;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("dedicated");

        let event = PlanEvent::Deleted {
            id: ReservationId::new(),
            queue: "dedicated".into(),
        };
        hub.send(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn events_stay_on_their_queue() {
        let hub = NotifyHub::new();
        let mut a = hub.subscribe("a");
        let _b = hub.subscribe("b");

        hub.send(&PlanEvent::Expired {
            id: ReservationId::new(),
            queue: "b".into(),
        });
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&PlanEvent::Deleted {
            id: ReservationId::new(),
            queue: "nobody".into(),
        });
    }

    #[tokio::test]
    async fn removed_channel_closes_receivers() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("gone");
        hub.remove("gone");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
