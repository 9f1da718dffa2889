//! WebSocket entry point: authenticate, run one connection, tear it down.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use haul_core::ids::ConnectionId;
use haul_core::models::Identity;
use haul_engine::Caller;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::handlers::{self, ConnectionContext};
use crate::server::AppState;

/// Server ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection that sends nothing, pongs included, for this long is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Close code for "internal error".
const CLOSE_INTERNAL: u16 = 1011;

/// Authenticate the upgrade request; 401 before any state is written.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = auth::extract_token(params.get("token").map(String::as_str), authorization);

    let identity = match state.auth.authenticate(token) {
        Ok(identity) => identity,
        Err(e) => {
            info!(error = %e, "websocket upgrade rejected");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "code": "UNAUTHORIZED", "message": e.to_string() })),
            )
                .into_response();
        }
    };
    let token = token.map(|t| SecretString::from(t.to_string()));

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, token))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    identity: Identity,
    token: Option<SecretString>,
) {
    let ctx = ConnectionContext {
        caller: Caller::new(ConnectionId::new(), identity),
        token,
    };
    let connection_id = ctx.caller.connection_id.clone();

    // Registered before the session exists so nothing addressed to it
    // right after `on_connect` is lost.
    let rx = state.clients.register(&connection_id);

    if let Err(e) = state.handlers.sessions.on_connect(&ctx.caller).await {
        warn!(connection_id = %connection_id, error = %e, "session not recorded, refusing connection");
        state.clients.unregister(&connection_id);
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_INTERNAL,
                reason: "session unavailable".into(),
            })))
            .await;
        return;
    }

    info!(
        connection_id = %connection_id,
        user_id = ?ctx.caller.identity.user_id,
        user_type = %ctx.caller.identity.user_type,
        "client connected"
    );

    run_connection(socket, &state, &ctx, rx).await;

    // Teardown runs once, whatever ended the connection.
    state.clients.unregister(&connection_id);
    state.handlers.rooms.leave_all(&ctx.caller);
    state.handlers.sessions.on_disconnect(&ctx.caller).await;
    info!(connection_id = %connection_id, "client disconnected");
}

/// Pump the socket until the peer leaves, errors, or goes quiet.
async fn run_connection(
    socket: WebSocket,
    state: &AppState,
    ctx: &ConnectionContext,
    mut rx: mpsc::Receiver<String>,
) {
    let connection_id = &ctx.caller.connection_id;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drain the send queue onto the socket + periodic ping
    let writer_cid = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader: frames are handled in arrival order, in this task
    loop {
        let next = tokio::select! {
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer stopped");
                break;
            }
            next = tokio::time::timeout(IDLE_TIMEOUT, ws_rx.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %connection_id, error = %e, "socket error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(connection_id = %connection_id, "idle timeout, closing");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                for frame in handlers::dispatch(&state.handlers, ctx, text.as_str()).await {
                    if let Some(json) = frame.to_json() {
                        state.clients.send_to(connection_id, json);
                    }
                }
            }
            WsMessage::Close(_) => break,
            // Pings are answered by axum; pongs only count as activity.
            _ => {}
        }
    }

    writer.abort();
}
