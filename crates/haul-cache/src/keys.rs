//! Key layout of the ephemeral store.

use haul_core::ids::{ConnectionId, RoomId};
use haul_core::models::UserType;

pub const SESSION_PREFIX: &str = "session:";
pub const PRESENCE_PREFIX: &str = "presence:";
pub const TYPING_PREFIX: &str = "typing:";
pub const HOLD_PREFIX: &str = "hold:";

pub fn session(connection_id: &ConnectionId) -> String {
    format!("{SESSION_PREFIX}{connection_id}")
}

pub fn presence(user_type: UserType, user_id: i64) -> String {
    format!("{PRESENCE_PREFIX}{user_type}:{user_id}")
}

pub fn typing(room: &RoomId, user_id: i64) -> String {
    format!("{TYPING_PREFIX}{room}:{user_id}")
}

pub fn hold(truck_id: i64) -> String {
    format!("{HOLD_PREFIX}{truck_id}")
}

/// Truck id encoded in a `hold:<truckId>` key.
pub fn truck_from_hold_key(key: &str) -> Option<i64> {
    key.strip_prefix(HOLD_PREFIX)?.parse().ok()
}
