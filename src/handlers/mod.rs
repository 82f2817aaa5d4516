//! HTTP and WebSocket request handlers.
//!
//! Each mutating handler follows the same shape: accept a raw JSON body,
//! run it through the dispatcher's field whitelist, deserialize into a
//! typed request, then hand off to the relevant core component.

pub mod admin;
pub mod health;
pub mod rooms;
pub mod webhook;
pub mod ws;
