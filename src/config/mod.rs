//! Process configuration
//!
//! Loaded once at startup from the environment (`.env` in development via
//! `dotenvy`, real env vars in production). Fields with sensible defaults are
//! documented inline; connection strings and secrets have none and panic
//! with a descriptive message if missing.

use std::env;
use std::time::Duration;

/// Typed, validated process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: String,
    pub session_signing_key: Vec<u8>,
    pub webhook_signing_key: Vec<u8>,

    pub room_defaults: RoomDefaults,
    pub idempotency_ttl: Duration,
    pub lockout_window: Duration,
    pub lockout_duration: Duration,
    pub lockout_threshold: u32,
    pub reauth_interval: Duration,
    pub session_ttl: Duration,
    pub db_timeout: Duration,

    pub queue_concurrency: usize,
    pub queue_max_attempts: u32,
    pub queue_initial_backoff: Duration,
    pub queue_backoff_factor: u32,
}

/// Per-room parameters a room inherits unless overridden in its own row.
#[derive(Debug, Clone, Copy)]
pub struct RoomDefaults {
    pub countdown_secs: u64,
    pub linger_secs: u64,
    pub watchdog_secs: u64,
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            countdown_secs: 30,
            linger_secs: 10,
            watchdog_secs: 15,
        }
    }
}

impl AppConfig {
    /// Build configuration from the process environment.
    ///
    /// Panics with a descriptive message when a required variable is
    /// missing, matching the fail-fast style the teacher uses for its own
    /// required secrets.
    pub fn from_env() -> Self {
        let database_url =
            env::var("DATABASE_URL").expect("DATABASE_URL must be set (postgres connection string)");
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let session_signing_key = env::var("SESSION_SIGNING_KEY")
            .expect("SESSION_SIGNING_KEY must be set (opaque-token HMAC key)")
            .into_bytes();
        let webhook_signing_key = env::var("WEBHOOK_SIGNING_KEY")
            .expect("WEBHOOK_SIGNING_KEY must be set (crypto deposit webhook HMAC key)")
            .into_bytes();

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Self {
            bind_addr,
            database_url,
            redis_url,
            session_signing_key,
            webhook_signing_key,
            room_defaults: RoomDefaults::default(),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            lockout_window: Duration::from_secs(15 * 60),
            lockout_duration: Duration::from_secs(30 * 60),
            lockout_threshold: 5,
            reauth_interval: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(60 * 60),
            db_timeout: Duration::from_secs(3),
            queue_concurrency: 10,
            queue_max_attempts: 3,
            queue_initial_backoff: Duration::from_secs(1),
            queue_backoff_factor: 2,
        }
    }
}
