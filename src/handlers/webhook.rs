//! Crypto deposit webhook (spec §6).
//!
//! The payload's `signature` field is an HMAC-SHA-256 over the remaining
//! fields using a secret shared with the deposit provider out of band; a
//! bad signature is rejected before the ledger is ever touched. A
//! duplicate `externalId` is a no-op success per the spec, enforced twice:
//! here by re-reading the current balance, and at the schema level by
//! `crypto_deposits`'s primary key.

use axum::{extract::State, response::IntoResponse, Json};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::UserId;
use crate::services::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct CryptoDepositWebhook {
    #[serde(rename = "externalId")]
    external_id: String,
    #[serde(rename = "userId")]
    user_id: Uuid,
    amount: Decimal,
    signature: String,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    ok: bool,
}

/// POST /webhooks/crypto-deposit
pub async fn crypto_deposit(
    State(state): State<AppState>,
    Json(body): Json<CryptoDepositWebhook>,
) -> Result<impl IntoResponse, EngineError> {
    let signed_payload = format!("{}:{}:{}", body.external_id, body.user_id, body.amount);
    let mut mac = HmacSha256::new_from_slice(&state.config.webhook_signing_key)
        .expect("HMAC accepts any key length");
    mac.update(signed_payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if !constant_time_eq(expected.as_bytes(), body.signature.as_bytes()) {
        return Err(EngineError::Validation("invalid webhook signature".into()));
    }

    let user_id = UserId(body.user_id);
    let new_balance = state
        .ledger
        .credit_crypto_deposit(user_id, "webhook", &body.external_id, body.amount)
        .await?;

    state.events.publish(
        &crate::eventbus::subjects::user_balance(user_id),
        serde_json::json!({ "reason": "deposit", "balance": new_balance }),
    );
    crate::cache::hot_reads::invalidate(&state.cache, &state.cache_stats, "bal", &user_id.to_string())
        .await;

    Ok(Json(WebhookResponse { ok: true }))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
