//! Admin balance adjustment (spec §4.1 `adminAdjust`).
//!
//! Restricted to callers whose session claims resolve to a user with the
//! `admin` role; the role check happens here rather than in a separate
//! middleware layer since it needs the ledger to resolve role from
//! `user_id`, and the spec has no other admin-only surface to share a
//! layer with yet.

use axum::{extract::State, response::IntoResponse, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::whitelists;
use crate::error::EngineError;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{Role, UserId};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminAdjustRequest {
    idempotency_key: String,
    user_id: Uuid,
    delta: Decimal,
    description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdminAdjustResponse {
    #[serde(rename = "newBalance")]
    new_balance: Decimal,
}

/// POST /admin/adjust
pub async fn admin_adjust(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Json(raw): Json<serde_json::Value>,
) -> Result<impl IntoResponse, EngineError> {
    state
        .dispatcher
        .enforce_field_whitelist(&raw, whitelists::ADMIN_ADJUST)?;

    let caller = state
        .ledger
        .get_user(claims.user_id)
        .await?
        .ok_or(EngineError::UserNotFound)?;
    if caller.role != Role::Admin {
        return Err(EngineError::Validation("admin role required".to_string()));
    }

    let req: AdminAdjustRequest =
        serde_json::from_value(raw).map_err(|e| EngineError::Validation(e.to_string()))?;

    let target = UserId(req.user_id);
    let ledger = state.ledger.clone();
    let idempotency_key = req.idempotency_key.clone();
    let new_balance = state
        .dispatcher
        .dispatch(target, &idempotency_key, || async move {
            ledger
                .admin_adjust(target, req.delta, &req.description)
                .await
                .map_err(crate::dispatcher::DispatcherError::from)
        })
        .await?;

    state.events.publish(
        &crate::eventbus::subjects::user_balance(target),
        serde_json::json!({ "reason": "adjustment" }),
    );
    crate::cache::hot_reads::invalidate(&state.cache, &state.cache_stats, "bal", &target.to_string())
        .await;

    Ok(Json(AdminAdjustResponse { new_balance }))
}
