use haul_core::ids::ConnectionId;
use haul_core::{Audience, Delivery, Frame, ServerEvent};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 4096;

/// Single ordered channel of outbound deliveries. Anything enqueued here
/// reaches connections in enqueue order; a transport that falls behind
/// loses deliveries rather than blocking producers.
#[derive(Clone)]
pub struct Outbox {
    tx: broadcast::Sender<Delivery>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }

    pub fn publish(&self, delivery: Delivery) {
        // Nobody listening means nobody to deliver to.
        let _ = self.tx.send(delivery);
    }

    pub fn unicast(&self, connection_id: &ConnectionId, event: &ServerEvent) {
        self.unicast_frame(connection_id, event.to_frame());
    }

    pub fn unicast_frame(&self, connection_id: &ConnectionId, frame: Frame) {
        self.publish(Delivery::new(Audience::Connection(connection_id.clone()), frame));
    }

    pub fn multicast(&self, members: Vec<ConnectionId>, event: &ServerEvent) {
        if members.is_empty() {
            return;
        }
        self.publish(Delivery::new(Audience::Members(members), event.to_frame()));
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        self.broadcast_frame(event.to_frame());
    }

    pub fn broadcast_frame(&self, frame: Frame) {
        self.publish(Delivery::new(Audience::Everyone, frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn deliveries_arrive_in_order() {
        let outbox = Outbox::new(16);
        let mut rx = outbox.subscribe();
        let conn = ConnectionId::new();

        outbox.unicast(&conn, &ServerEvent::HeartbeatAck { timestamp: Utc::now() });
        outbox.broadcast(&ServerEvent::HoldRemoved { truck_id: 5, dispatcher_id: None });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event(), "heartbeat_ack");
        assert_eq!(first.audience, Audience::Connection(conn));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.event(), "hold_removed");
        assert_eq!(second.audience, Audience::Everyone);
    }

    #[tokio::test]
    async fn empty_multicast_is_dropped() {
        let outbox = Outbox::new(16);
        let mut rx = outbox.subscribe();
        outbox.multicast(Vec::new(), &ServerEvent::HoldRemoved { truck_id: 1, dispatcher_id: None });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let outbox = Outbox::default();
        outbox.broadcast(&ServerEvent::HoldRemoved { truck_id: 1, dispatcher_id: None });
    }
}
