//! Session-token authentication (spec §4.7).
//!
//! Validates the `Authorization: Bearer <token>` header against the
//! session authority (signature, expiry with a buffer, revocation list)
//! and inserts the resolved [`Claims`] into the request extensions for
//! handlers to pull out via [`AuthenticatedUser`]. Keeps the teacher's own
//! Bearer-header-parsing shape (`strip_prefix("Bearer ")`), generalized
//! from a single static admin key to per-user signed, expiring tokens.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::services::AppState;
use crate::session::Claims;

/// Require a valid session token, rejecting the request before it reaches
/// the handler if the token is missing, malformed, expired, or revoked.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let token = auth_header.strip_prefix("Bearer ").unwrap_or(auth_header);
    if token.is_empty() {
        return Err((StatusCode::UNAUTHORIZED, "missing session token").into_response());
    }

    match state.session.validate(token).await {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            Ok(next.run(req).await)
        }
        Err(err) => {
            tracing::debug!(error = %err, "session validation failed");
            Err((StatusCode::UNAUTHORIZED, err.to_string()).into_response())
        }
    }
}

/// Extractor pulling the [`Claims`] inserted by [`require_session`] out of
/// request extensions, for handlers that need the caller's identity.
pub struct AuthenticatedUser(pub Claims);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .copied()
            .map(AuthenticatedUser)
            .ok_or_else(|| {
                (StatusCode::UNAUTHORIZED, "request was not authenticated").into_response()
            })
    }
}
