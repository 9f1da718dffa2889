//! Domain records shared by the stores, the engine and the wire layer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Dispatcher,
    Driver,
}

impl UserType {
    /// `admin` and `dispatcher` act as dispatchers; every other role,
    /// including unknown ones, is treated as a driver.
    pub fn from_role(role: &str) -> Self {
        match role {
            "admin" | "dispatcher" => Self::Dispatcher,
            _ => Self::Driver,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatcher => "dispatcher",
            Self::Driver => "driver",
        }
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatcher" => Ok(Self::Dispatcher),
            "driver" => Ok(Self::Driver),
            other => Err(format!("unknown user type: {other}")),
        }
    }
}

/// Who is on the other end of a connection, as extracted from the token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Option<i64>,
    pub username: String,
    pub role: String,
    pub user_type: UserType,
}

impl Identity {
    pub fn is_dispatcher(&self) -> bool {
        self.user_type == UserType::Dispatcher
    }
}

/// Session record kept in the ephemeral store under `session:<connectionId>`.
/// The bearer token is deliberately absent; it stays in process memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub connection_id: ConnectionId,
    pub user_id: Option<i64>,
    pub username: String,
    pub user_type: UserType,
    pub role: String,
    pub connected_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(connection_id: ConnectionId, identity: &Identity) -> Self {
        Self {
            connection_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            user_type: identity.user_type,
            role: identity.role.clone(),
            connected_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub connection_id: Option<ConnectionId>,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A persisted chat message. Immutable apart from `is_read`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub offer_id: i64,
    pub driver_id: i64,
    pub sender_type: UserType,
    pub sender_id: i64,
    pub message: String,
    pub message_type: MessageType,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Exclusive, time-bounded reservation of a truck.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldRecord {
    pub truck_id: i64,
    pub dispatcher_id: i64,
    pub dispatcher_name: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HoldRecord {
    pub fn new(
        truck_id: i64,
        dispatcher_id: i64,
        dispatcher_name: impl Into<String>,
        started_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let window = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Self {
            truck_id,
            dispatcher_id,
            dispatcher_name: dispatcher_name.into(),
            started_at,
            expires_at: started_at + window,
        }
    }

    /// Time left before the hold lapses, or `None` once it has.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn is_held_by(&self, dispatcher_id: i64) -> bool {
        self.dispatcher_id == dispatcher_id
    }
}
