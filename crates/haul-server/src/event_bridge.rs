use std::sync::Arc;

use haul_core::Delivery;
use tokio::sync::broadcast;

use crate::client::ClientRegistry;

/// Forward outbox deliveries to the connections registered on this node.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    mut rx: broadcast::Receiver<Delivery>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delivery) => {
                    let reached = registry.deliver(&delivery);
                    tracing::trace!(event = delivery.event(), reached, "delivery forwarded");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event bridge lagged, dropped deliveries");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bridge channel closed");
                    break;
                }
            }
        }
    })
}
