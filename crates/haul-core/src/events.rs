use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ConnectionId;
use crate::models::{ChatMessage, HoldRecord, UserType};

/// One JSON frame on the socket, in either direction:
/// `{ "event": <name>, "data": <payload> }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Reason attached to `error` / `hold_error` frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Events the core pushes to connections. Names and payload shapes are the
/// client compatibility contract.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ChatHistory {
        offer_id: i64,
        driver_id: i64,
        messages: Vec<ChatMessage>,
    },

    ReceiveMessage(ChatMessage),

    #[serde(rename_all = "camelCase")]
    UserJoined {
        offer_id: i64,
        driver_id: i64,
        user_id: Option<i64>,
        username: String,
        user_type: UserType,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        offer_id: i64,
        driver_id: i64,
        user_id: Option<i64>,
        username: String,
    },

    #[serde(rename_all = "camelCase")]
    UserTyping {
        offer_id: i64,
        driver_id: i64,
        user_id: Option<i64>,
        username: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    MessageReadConfirmed {
        message_id: i64,
        offer_id: i64,
        driver_id: i64,
        reader_id: Option<i64>,
        reader_type: UserType,
    },

    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },

    HoldPlaced(HoldRecord),

    #[serde(rename_all = "camelCase")]
    HoldRemoved {
        truck_id: i64,
        dispatcher_id: Option<i64>,
    },

    #[serde(rename_all = "camelCase")]
    HoldExpired {
        truck_id: i64,
        expired_at: DateTime<Utc>,
    },

    ActiveHolds {
        holds: Vec<HoldRecord>,
    },

    Error(Rejection),

    HoldError(Rejection),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatHistory { .. } => "chat_history",
            Self::ReceiveMessage(_) => "receive_message",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserTyping { .. } => "user_typing",
            Self::MessageReadConfirmed { .. } => "message_read_confirmed",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::HoldPlaced(_) => "hold_placed",
            Self::HoldRemoved { .. } => "hold_removed",
            Self::HoldExpired { .. } => "hold_expired",
            Self::ActiveHolds { .. } => "active_holds",
            Self::Error(_) => "error",
            Self::HoldError(_) => "hold_error",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let data = serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null);
        Frame::new(self.name(), data)
    }
}

/// Who a frame is addressed to.
#[derive(Clone, Debug, PartialEq)]
pub enum Audience {
    Connection(ConnectionId),
    Members(Vec<ConnectionId>),
    Everyone,
}

/// A frame plus its audience, queued on the outbox for the transport.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub audience: Audience,
    pub frame: Frame,
}

impl Delivery {
    pub fn new(audience: Audience, frame: Frame) -> Self {
        Self { audience, frame }
    }

    pub fn event(&self) -> &str {
        &self.frame.event
    }

    pub fn reaches(&self, connection_id: &ConnectionId) -> bool {
        match &self.audience {
            Audience::Connection(id) => id == connection_id,
            Audience::Members(ids) => ids.contains(connection_id),
            Audience::Everyone => true,
        }
    }
}
