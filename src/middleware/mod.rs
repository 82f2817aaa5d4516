//! Axum middleware: session-token extraction ahead of handlers that need
//! an authenticated caller.

pub mod auth;
