//! Inbound webhooks from the main backend. Each one is translated into the
//! same outbox/cache operation the engine uses internally.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use haul_core::models::{ChatMessage, MessageType, UserType};
use haul_core::{Frame, RelayError};
use haul_engine::ExternalHold;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::protocol::{flexible_id, flexible_id_opt};
use crate::server::AppState;

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing or wrong webhook secret")]
    Unauthorized,
    #[error("malformed body: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Relay(e) => match e {
                RelayError::InvalidRequest(_) | RelayError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
                RelayError::Unauthorized(_) | RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
                RelayError::NotFound(_) => StatusCode::NOT_FOUND,
                RelayError::AlreadyHeld { .. } => StatusCode::CONFLICT,
                RelayError::SyncFailed(_) => StatusCode::BAD_GATEWAY,
                RelayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest(_) => "INVALID_REQUEST",
            Self::Relay(e) => e.code(),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "webhook failed");
        }
        let message = match &self {
            Self::Relay(e) => e.to_rejection("webhook").message,
            other => other.to_string(),
        };
        (status, Json(json!({ "code": self.code(), "message": message }))).into_response()
    }
}

type WebhookResult = Result<Json<Value>, WebhookError>;

pub fn verify_secret(expected: &SecretString, headers: &HeaderMap) -> Result<(), WebhookError> {
    let given = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::Unauthorized)?;
    let expected = expected.expose_secret();
    if expected.is_empty() || !constant_time_eq(given.as_bytes(), expected.as_bytes()) {
        return Err(WebhookError::Unauthorized);
    }
    Ok(())
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::BadRequest(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, WebhookError> {
    T::deserialize(value).map_err(|e| WebhookError::BadRequest(e.to_string()))
}

// ── offer-created ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferCreated {
    #[serde(alias = "id", deserialize_with = "flexible_id")]
    offer_id: i64,
    #[serde(default, deserialize_with = "flexible_id_opt")]
    driver_id: Option<i64>,
}

pub async fn offer_created(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResult {
    verify_secret(&state.webhook_secret, &headers)?;
    let payload: Value = parse_body(&body)?;
    let offer: OfferCreated = decode(&payload)?;

    let repo = Arc::clone(&state.offers);
    let raw = payload.clone();
    let (offer_id, driver_id) = (offer.offer_id, offer.driver_id);
    haul_engine::run_blocking(move || repo.record(offer_id, driver_id, &raw)).await?;

    let frame = Frame::new("new_offer", payload);
    let outbox = &state.outbox;
    let delivered = match offer.driver_id {
        Some(driver_id) => {
            let presence = state.handlers.sessions.presence();
            match presence.reachable_connection(UserType::Driver, driver_id).await {
                Some(connection_id) => {
                    outbox.unicast_frame(&connection_id, frame);
                    "unicast"
                }
                None => "skipped",
            }
        }
        None => {
            outbox.broadcast_frame(frame);
            "broadcast"
        }
    };

    info!(offer_id = offer.offer_id, driver_id = ?offer.driver_id, delivered, "offer received");
    Ok(Json(json!({ "ok": true, "delivered": delivered })))
}

// ── message-sent ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSent {
    #[serde(deserialize_with = "flexible_id")]
    id: i64,
    #[serde(deserialize_with = "flexible_id")]
    offer_id: i64,
    #[serde(deserialize_with = "flexible_id")]
    driver_id: i64,
    sender_type: UserType,
    #[serde(deserialize_with = "flexible_id")]
    sender_id: i64,
    message: String,
    #[serde(default)]
    message_type: MessageType,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<MessageSent> for ChatMessage {
    fn from(m: MessageSent) -> Self {
        Self {
            id: m.id,
            offer_id: m.offer_id,
            driver_id: m.driver_id,
            sender_type: m.sender_type,
            sender_id: m.sender_id,
            message: m.message,
            message_type: m.message_type,
            is_read: m.is_read,
            created_at: m.created_at.unwrap_or_else(Utc::now),
        }
    }
}

pub async fn message_sent(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResult {
    verify_secret(&state.webhook_secret, &headers)?;
    let message: MessageSent = parse_body(&body)?;
    let message = ChatMessage::from(message);
    info!(message_id = message.id, offer_id = message.offer_id, driver_id = message.driver_id, "external message relayed");
    state.handlers.rooms.relay_external(message);
    Ok(Json(json!({ "ok": true })))
}

// ── holds ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoldPlaced {
    #[serde(deserialize_with = "flexible_id")]
    truck_id: i64,
    #[serde(deserialize_with = "flexible_id")]
    dispatcher_id: i64,
    dispatcher_name: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoldRemoved {
    #[serde(deserialize_with = "flexible_id")]
    truck_id: i64,
    #[serde(default, deserialize_with = "flexible_id_opt")]
    dispatcher_id: Option<i64>,
}

pub async fn hold_placed(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResult {
    verify_secret(&state.webhook_secret, &headers)?;
    let hold: HoldPlaced = parse_body(&body)?;
    let cached = state
        .handlers
        .holds
        .cache_external_hold(ExternalHold {
            truck_id: hold.truck_id,
            dispatcher_id: hold.dispatcher_id,
            dispatcher_name: hold.dispatcher_name,
            started_at: hold.started_at,
            expires_at: hold.expires_at,
        })
        .await?;
    Ok(Json(json!({ "ok": true, "cached": cached.is_some() })))
}

pub async fn hold_removed(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> WebhookResult {
    verify_secret(&state.webhook_secret, &headers)?;
    let removed: HoldRemoved = parse_body(&body)?;
    state
        .handlers
        .holds
        .evict_external_hold(removed.truck_id, removed.dispatcher_id)
        .await?;
    Ok(Json(json!({ "ok": true })))
}
