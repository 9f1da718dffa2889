//! Coordination engine: sessions, presence, chat rooms and truck holds.
//!
//! Nothing here touches a socket. Every push to a connection is a
//! [`Delivery`](haul_core::Delivery) queued on the [`Outbox`].

pub mod authority;
pub mod best_effort;
pub mod holds;
pub mod outbox;
pub mod presence;
pub mod rooms;
pub mod sessions;

pub use authority::{AuthorityError, HoldAuthority, HttpAuthority};
pub use holds::{ExternalHold, HoldConfig, HoldManager};
pub use outbox::Outbox;
pub use presence::{PresenceConfig, PresenceTracker};
pub use rooms::{RoomBus, RoomConfig, RoomRegistry};
pub use sessions::{SessionConfig, SessionRegistry};

use haul_core::ids::ConnectionId;
use haul_core::models::Identity;
use haul_core::RelayError;

/// The connection an operation is performed on behalf of.
#[derive(Clone, Debug)]
pub struct Caller {
    pub connection_id: ConnectionId,
    pub identity: Identity,
}

impl Caller {
    pub fn new(connection_id: ConnectionId, identity: Identity) -> Self {
        Self {
            connection_id,
            identity,
        }
    }
}

/// Run synchronous durable-store work on the blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T, RelayError>
where
    F: FnOnce() -> Result<T, haul_store::StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::Store(format!("blocking task failed: {e}")))?
        .map_err(RelayError::from)
}
