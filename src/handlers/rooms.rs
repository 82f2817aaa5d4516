//! Join/leave endpoints (spec §4.8).
//!
//! The mass-assignment defense runs before typed deserialization: the raw
//! JSON body is checked against a field whitelist first, so a client that
//! tries to set its own `betAmount` (instead of the server-computed
//! `room.entry_fee`) is rejected outright rather than silently ignored.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::{self, whitelists};
use crate::error::EngineError;
use crate::middleware::auth::AuthenticatedUser;
use crate::services::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomRequest {
    idempotency_key: String,
    client_fingerprint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRoomRequest {
    idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomActionResponse {
    ok: bool,
}

/// POST /rooms/{roomId}/join
pub async fn join_room(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(room_id): Path<Uuid>,
    Json(raw): Json<serde_json::Value>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .dispatcher
        .enforce_field_whitelist(&raw, whitelists::JOIN_ROOM)?;

    let req: JoinRoomRequest = serde_json::from_value(raw)
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let room_id = crate::models::RoomId(room_id);
    let room = load_room(&state, room_id).await?;
    if room.status != crate::models::RoomStatus::Waiting {
        return Err(EngineError::RoomNotJoinable);
    }
    let scheduler = state.rooms.ensure_spawned(room.clone());

    let user_id = claims.user_id;
    dispatcher::join_room(
        &state.dispatcher,
        &scheduler,
        user_id,
        &req.idempotency_key,
        room.entry_fee,
        req.client_fingerprint,
    )
    .await?;

    Ok(Json(RoomActionResponse { ok: true }))
}

/// POST /rooms/{roomId}/leave
pub async fn leave_room(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(room_id): Path<Uuid>,
    Json(raw): Json<serde_json::Value>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .dispatcher
        .enforce_field_whitelist(&raw, whitelists::LEAVE_ROOM)?;

    let req: LeaveRoomRequest =
        serde_json::from_value(raw).map_err(|e| EngineError::Validation(e.to_string()))?;

    let room_id = crate::models::RoomId(room_id);
    let room = load_room(&state, room_id).await?;
    let Some(scheduler) = state.rooms.get(room.id) else {
        return Err(EngineError::NotParticipating);
    };

    dispatcher::leave_room(&state.dispatcher, &scheduler, claims.user_id, &req.idempotency_key)
        .await?;

    Ok(Json(RoomActionResponse { ok: true }))
}

async fn load_room(
    state: &AppState,
    room_id: crate::models::RoomId,
) -> Result<crate::models::Room, EngineError> {
    state
        .ledger
        .get_room(room_id)
        .await?
        .ok_or(EngineError::RoomNotJoinable)
}
