//! Inbound frame payloads and the rejection frames sent back for them.

use haul_core::{Frame, RelayError, ServerEvent};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

/// Read an id that may arrive as a number or a numeric string.
pub fn id_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| serde::de::Error::custom(format!("expected a numeric id, got {value}")))
}

pub fn flexible_id_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => id_from_value(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected a numeric id, got {v}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    #[serde(deserialize_with = "flexible_id")]
    pub offer_id: i64,
    #[serde(deserialize_with = "flexible_id")]
    pub driver_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(deserialize_with = "flexible_id")]
    pub offer_id: i64,
    #[serde(deserialize_with = "flexible_id")]
    pub driver_id: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    #[serde(deserialize_with = "flexible_id")]
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldPayload {
    #[serde(deserialize_with = "flexible_id")]
    pub truck_id: i64,
    #[serde(default)]
    pub dispatcher_name: Option<String>,
}

pub fn parse<T: DeserializeOwned>(data: Value) -> Result<T, RelayError> {
    serde_json::from_value(data).map_err(|e| RelayError::InvalidRequest(e.to_string()))
}

pub fn is_hold_event(event: &str) -> bool {
    matches!(event, "place_hold" | "remove_hold" | "get_active_holds")
}

/// `hold_error` for hold events, `error` for everything else.
pub fn rejection_frame(event: &str, err: &RelayError) -> Frame {
    let rejection = err.to_rejection(event);
    if is_hold_event(event) {
        ServerEvent::HoldError(rejection).to_frame()
    } else {
        ServerEvent::Error(rejection).to_frame()
    }
}
