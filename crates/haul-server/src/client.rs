use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use haul_core::ids::ConnectionId;
use haul_core::{Audience, Delivery};
use tokio::sync::mpsc;

/// Outbound half of a live socket.
pub struct Client {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
}

impl Client {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn push(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Registry of all connected WebSocket clients on this node.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a connection and return the receiving end of its send queue.
    pub fn register(&self, id: &ConnectionId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        rx
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Queue a message for one connection. Full queues drop the message.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(client) = self.clients.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        client.push(message)
    }

    /// Route an outbox delivery to the connections it addresses on this node.
    /// Returns how many queues accepted it.
    pub fn deliver(&self, delivery: &Delivery) -> usize {
        let Some(json) = delivery.frame.to_json() else {
            tracing::warn!(event = delivery.event(), "unserializable frame dropped");
            return 0;
        };

        match &delivery.audience {
            Audience::Connection(id) => usize::from(self.send_to(id, json)),
            Audience::Members(ids) => ids
                .iter()
                .filter(|id| self.send_to(id, json.clone()))
                .count(),
            Audience::Everyone => {
                let targets: Vec<Arc<Client>> = self
                    .clients
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                targets
                    .iter()
                    .filter(|c| c.is_connected() && c.push(json.clone()))
                    .count()
            }
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn is_registered(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }
}
