//! Liveness probe and cache observability (spec §4.9's debug-endpoint
//! counters rather than a full Prometheus exporter).

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::services::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lotto-room-engine",
    }))
}

/// GET /debug/cache-stats
pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let (hits, misses, evictions) = state.cache_stats.snapshot();
    Json(serde_json::json!({
        "hits": hits,
        "misses": misses,
        "evictions": evictions,
    }))
}
