//! Real-time multiplayer lottery/elimination-game room engine.
//!
//! Boots the core components (ledger, cache, event bus, room registry,
//! payout queue, session authority, dispatcher — spec §2) into a single
//! [`services::AppState`] and serves the HTTP/WebSocket surface over it.

use std::net::SocketAddr;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod config;
mod dispatcher;
mod error;
mod eventbus;
mod handlers;
mod ledger;
mod middleware;
mod models;
mod oracle;
mod queue;
mod scheduler;
mod services;
mod session;

use config::AppConfig;
use services::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lotto_room_engine=debug,tower_http=debug,axum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run pending migrations");

    let cache = cache::Cache::connect(&config.redis_url)
        .await
        .expect("failed to connect to redis");

    let ledger = ledger::Ledger::new(pool, config.db_timeout);
    let state = AppState::new(config, ledger, cache);

    let bind_addr = state.config.bind_addr.clone();

    let authenticated = Router::new()
        .route("/rooms/{roomId}/join", post(handlers::rooms::join_room))
        .route("/rooms/{roomId}/leave", post(handlers::rooms::leave_room))
        .route("/admin/adjust", post(handlers::admin::admin_adjust))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::auth::require_session,
        ));

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/debug/cache-stats", get(handlers::health::cache_stats))
        .route("/ws", get(handlers::ws::ws_handler))
        .route(
            "/webhooks/crypto-deposit",
            post(handlers::webhook::crypto_deposit),
        )
        .merge(authenticated)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = bind_addr.parse().expect("BIND_ADDR must be host:port");
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
