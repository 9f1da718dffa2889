//! Frame handlers, one per inbound event name.

use std::sync::Arc;

use haul_core::ids::RoomId;
use haul_core::{Frame, RelayError, ServerEvent};
use haul_engine::{Caller, HoldManager, RoomBus, SessionRegistry};
use secrecy::SecretString;
use serde_json::Value;

use crate::protocol::{self, HoldPayload, MarkReadPayload, RoomPayload, SendMessagePayload};

/// Shared state available to all handlers.
pub struct HandlerState {
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomBus>,
    pub holds: Arc<HoldManager>,
}

/// Per-connection context. The token is kept only here, for forwarding to
/// the hold authority.
pub struct ConnectionContext {
    pub caller: Caller,
    pub token: Option<SecretString>,
}

type Outcome = Result<Vec<Frame>, RelayError>;

/// Parse one raw frame and route it. Returns the frames to send back to
/// the originating connection; fan-out goes through the outbox.
pub async fn dispatch(state: &HandlerState, ctx: &ConnectionContext, raw: &str) -> Vec<Frame> {
    let frame: Frame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            let err = RelayError::InvalidRequest(format!("unparsable frame: {e}"));
            return vec![protocol::rejection_frame("unknown", &err)];
        }
    };
    handle(state, ctx, &frame.event, frame.data).await
}

pub async fn handle(state: &HandlerState, ctx: &ConnectionContext, event: &str, data: Value) -> Vec<Frame> {
    let outcome = match event {
        // Chat
        "join_offer_chat" => join_offer_chat(state, ctx, data).await,
        "leave_offer_chat" => leave_offer_chat(state, ctx, data),
        "send_message" => send_message(state, ctx, data).await,
        "typing_start" => typing(state, ctx, data, true).await,
        "typing_stop" => typing(state, ctx, data, false).await,
        "mark_message_read" => mark_message_read(state, ctx, data).await,

        // Session
        "heartbeat" => heartbeat(state, ctx).await,

        // Holds
        "place_hold" => place_hold(state, ctx, data).await,
        "remove_hold" => remove_hold(state, ctx, data).await,
        "get_active_holds" => get_active_holds(state).await,

        other => Err(RelayError::InvalidRequest(format!("unknown event: {other}"))),
    };

    match outcome {
        Ok(frames) => frames,
        Err(err) => {
            if err.is_infrastructure() {
                tracing::warn!(connection_id = %ctx.caller.connection_id, event, error = %err, "request failed");
            } else {
                tracing::debug!(connection_id = %ctx.caller.connection_id, event, error = %err, "request rejected");
            }
            vec![protocol::rejection_frame(event, &err)]
        }
    }
}

fn room_of(offer_id: i64, driver_id: i64) -> RoomId {
    RoomId::new(offer_id, driver_id)
}

async fn join_offer_chat(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let p: RoomPayload = protocol::parse(data)?;
    // History is queued through the outbox, ahead of any later message.
    state.rooms.join(&ctx.caller, room_of(p.offer_id, p.driver_id)).await?;
    Ok(Vec::new())
}

fn leave_offer_chat(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let p: RoomPayload = protocol::parse(data)?;
    state.rooms.leave(&ctx.caller, room_of(p.offer_id, p.driver_id));
    Ok(Vec::new())
}

async fn send_message(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let p: SendMessagePayload = protocol::parse(data)?;
    state
        .rooms
        .send(
            &ctx.caller,
            room_of(p.offer_id, p.driver_id),
            &p.message,
            p.message_type.as_deref(),
        )
        .await?;
    Ok(Vec::new())
}

async fn typing(state: &HandlerState, ctx: &ConnectionContext, data: Value, is_typing: bool) -> Outcome {
    let p: RoomPayload = protocol::parse(data)?;
    state
        .rooms
        .set_typing(&ctx.caller, room_of(p.offer_id, p.driver_id), is_typing)
        .await?;
    Ok(Vec::new())
}

async fn mark_message_read(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let p: MarkReadPayload = protocol::parse(data)?;
    state.rooms.mark_read(&ctx.caller, p.message_id).await?;
    Ok(Vec::new())
}

async fn heartbeat(state: &HandlerState, ctx: &ConnectionContext) -> Outcome {
    let timestamp = state.sessions.heartbeat(&ctx.caller).await;
    Ok(vec![ServerEvent::HeartbeatAck { timestamp }.to_frame()])
}

/// Holds are placed and released by dispatchers, in their own name.
fn dispatcher_id(ctx: &ConnectionContext) -> Result<i64, RelayError> {
    if !ctx.caller.identity.is_dispatcher() {
        return Err(RelayError::Unauthorized("only dispatchers manage holds".into()));
    }
    ctx.caller
        .identity
        .user_id
        .ok_or_else(|| RelayError::InvalidRequest("dispatcherId is required".into()))
}

async fn place_hold(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let dispatcher_id = dispatcher_id(ctx)?;
    let p: HoldPayload = protocol::parse(data)?;
    let name = p
        .dispatcher_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| ctx.caller.identity.username.clone());

    state
        .holds
        .place(p.truck_id, dispatcher_id, &name, ctx.token.as_ref())
        .await?;
    Ok(Vec::new())
}

async fn remove_hold(state: &HandlerState, ctx: &ConnectionContext, data: Value) -> Outcome {
    let dispatcher_id = dispatcher_id(ctx)?;
    let p: HoldPayload = protocol::parse(data)?;
    state
        .holds
        .release(p.truck_id, dispatcher_id, ctx.token.as_ref())
        .await?;
    Ok(Vec::new())
}

async fn get_active_holds(state: &HandlerState) -> Outcome {
    let holds = state.holds.list_active().await?;
    Ok(vec![ServerEvent::ActiveHolds { holds }.to_frame()])
}
