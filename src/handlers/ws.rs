//! WebSocket adapter (spec §4.3's "boundary to the network"): forwards
//! `EventBus` envelopes to a connected client without reordering or
//! dropping anything other than what the bus itself already coalesces.
//! The `state` subject is the one place a lagging client should not
//! replay history — an `overflow` envelope on it means "refetch a fresh
//! snapshot", so callers that care about staleness only ever need that
//! one subject's semantics, not per-event diffing.
//!
//! Grounded on the teacher's chat-room websocket handler (broadcast
//! channel fan-out per connection), generalised from one fixed room
//! channel to the multi-subject `EventBus` plus session-token auth on
//! connect, since this deployment has no anonymous surface.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::eventbus::subjects;
use crate::models::{RoomId, UserId};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: String,
    room: Option<Uuid>,
}

/// GET /ws?token=...&room=...
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.session.validate(&params.token).await {
        Ok(claims) => {
            let room = params.room.map(RoomId);
            ws.on_upgrade(move |socket| handle_socket(socket, state, claims.user_id.0, room))
        }
        Err(_) => axum::http::StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid, room: Option<RoomId>) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = UserId(user_id);

    let mut balance_sub = state.events.subscribe(&subjects::user_balance(user_id));
    let mut global_sub = state.events.subscribe(&subjects::global_result());

    let mut state_sub = room.map(|r| state.events.subscribe(&subjects::room_state(r)));
    let mut ticks_sub = room.map(|r| state.events.subscribe(&subjects::room_ticks(r)));
    let mut animation_sub = room.map(|r| state.events.subscribe(&subjects::room_animation(r)));
    let mut result_sub = room.map(|r| state.events.subscribe(&subjects::room_result(r)));

    tracing::info!(%user_id, ?room, "websocket connected");

    loop {
        tokio::select! {
            envelope = balance_sub.recv() => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            envelope = global_sub.recv() => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            envelope = recv_optional(&mut state_sub) => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            envelope = recv_optional(&mut ticks_sub) => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            envelope = recv_optional(&mut animation_sub) => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            envelope = recv_optional(&mut result_sub) => {
                if forward(&mut sender, envelope).await.is_err() { break; }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() { break; }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    tracing::info!(%user_id, "websocket disconnected");
}

/// Awaits a subscription that may not exist (no room was requested) without
/// ever resolving — lets it sit harmlessly alongside the other branches in
/// `select!`.
async fn recv_optional(sub: &mut Option<crate::eventbus::Subscription>) -> crate::eventbus::Envelope {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    envelope: crate::eventbus::Envelope,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(&envelope).expect("Envelope always serializes");
    sender.send(Message::Text(text.into())).await
}
