//! Session authority (spec §4.7) — C7
//!
//! Issues and validates opaque, HMAC-signed session tokens and runs the
//! periodic re-authentication sweep that closes subscriptions whose token
//! has expired, been revoked, or gone missing. Grounded on the teacher's
//! own Bearer-token middleware (`middleware/auth.rs`) for the
//! extraction/validation shape, generalised from a single static admin key
//! to per-user signed, expiring, revocable tokens, with revocation state
//! delegated to [`crate::cache::revocation`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cache::{revocation, Cache};
use crate::models::{TokenId, UserId};

type HmacSha256 = Hmac<Sha256>;

/// Tokens are rejected this long before their literal expiry, so a
/// request that starts just under the wire doesn't finish past it.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("session token is malformed")]
    Malformed,
    #[error("session token signature is invalid")]
    BadSignature,
    #[error("session token has expired")]
    Expired,
    #[error("session token has been revoked")]
    Revoked,
}

#[derive(Debug, Clone, Copy)]
pub struct Claims {
    pub token_id: TokenId,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionAuthority {
    signing_key: Vec<u8>,
    cache: Cache,
    ttl: Duration,
}

impl SessionAuthority {
    pub fn new(signing_key: Vec<u8>, cache: Cache, ttl: Duration) -> Self {
        Self {
            signing_key,
            cache,
            ttl,
        }
    }

    /// Issue a new opaque token for `user_id`. The wire format is
    /// `<payload_b64>.<hmac_hex>` where payload is a small JSON blob; this
    /// mirrors the teacher's own `Bearer <token>` header convention while
    /// making the token self-describing and independently verifiable.
    pub fn issue(&self, user_id: UserId) -> (String, Claims) {
        let now = Utc::now();
        let claims = Claims {
            token_id: TokenId(uuid::Uuid::new_v4()),
            user_id,
            issued_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1)),
        };
        (self.encode(&claims), claims)
    }

    fn encode(&self, claims: &Claims) -> String {
        let payload = serde_json::json!({
            "tid": claims.token_id.0,
            "uid": claims.user_id.0,
            "iat": claims.issued_at.timestamp(),
            "exp": claims.expires_at.timestamp(),
        });
        let payload_b64 = base64_encode(payload.to_string().as_bytes());
        let signature = self.sign(&payload_b64);
        format!("{payload_b64}.{signature}")
    }

    fn sign(&self, payload_b64: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).expect("HMAC accepts any key length");
        mac.update(payload_b64.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate signature, expiry (with buffer), and revocation status for
    /// a raw token string extracted from an `Authorization: Bearer` header.
    pub async fn validate(&self, token: &str) -> Result<Claims, SessionError> {
        let (payload_b64, signature) = token.split_once('.').ok_or(SessionError::Malformed)?;
        let expected = self.sign(payload_b64);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(SessionError::BadSignature);
        }

        let raw = base64_decode(payload_b64).ok_or(SessionError::Malformed)?;
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|_| SessionError::Malformed)?;
        let claims = parse_claims(&value).ok_or(SessionError::Malformed)?;

        let buffered_expiry = claims.expires_at
            - chrono::Duration::from_std(EXPIRY_BUFFER).unwrap_or(chrono::Duration::seconds(60));
        if Utc::now() >= buffered_expiry {
            return Err(SessionError::Expired);
        }

        if revocation::is_revoked(&self.cache, claims.token_id).await {
            return Err(SessionError::Revoked);
        }

        Ok(claims)
    }

    /// Revoke a token immediately, e.g. on logout. TTL is set to the
    /// token's own remaining lifetime so the revocation entry never
    /// outlives a token that would have expired anyway.
    pub async fn revoke(&self, claims: &Claims) {
        let remaining = (claims.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        revocation::revoke(&self.cache, claims.token_id, remaining).await;
    }
}

fn parse_claims(value: &serde_json::Value) -> Option<Claims> {
    let token_id = TokenId(uuid::Uuid::parse_str(value.get("tid")?.as_str()?).ok()?);
    let user_id = UserId(uuid::Uuid::parse_str(value.get("uid")?.as_str()?).ok()?);
    let issued_at = DateTime::<Utc>::from_timestamp(value.get("iat")?.as_i64()?, 0)?;
    let expires_at = DateTime::<Utc>::from_timestamp(value.get("exp")?.as_i64()?, 0)?;
    Some(Claims {
        token_id,
        user_id,
        issued_at,
        expires_at,
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s).ok()
}

/// Periodic re-authentication sweep (spec §4.7): every `interval`, re-check
/// a live subscription's token and invoke `on_closed` with a reason if it
/// is no longer valid. Callers spawn one of these per active subscription
/// (or drive a shared set); kept as a free function so the dispatcher and
/// websocket handlers can compose it with their own subscription lifetime.
pub async fn reauth_loop<F>(
    authority: SessionAuthority,
    token: String,
    interval: Duration,
    mut on_closed: F,
) where
    F: FnMut(SessionError) + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = authority.validate(&token).await {
            on_closed(err);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn base64_round_trips() {
        let original = b"hello session";
        let encoded = base64_encode(original);
        assert_eq!(base64_decode(&encoded).unwrap(), original);
    }
}
