//! Request dispatcher (spec §4.8) — C8
//!
//! Composes every cross-cutting concern a mutating request needs, in the
//! order the spec fixes: idempotency replay, per-user in-flight lock,
//! mass-assignment whitelist check, the ledger/scheduler call itself, then
//! event publication. Grounded on the teacher's handler-composition style
//! (`handlers/transaction.rs` chained auth → validation → service call
//! before it was trimmed); the per-user lock registry mirrors the
//! `DashMap`-of-handles pattern already used for [`crate::eventbus::EventBus`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::{idempotency, Cache};
use crate::ledger::LedgerError;
use crate::models::{UserId, validate_idempotency_key};
use crate::scheduler::{SchedulerError, SchedulerHandle};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("idempotency key invalid: {0}")]
    InvalidIdempotencyKey(&'static str),
    #[error("field {0:?} is not permitted on this endpoint")]
    MassAssignmentBlocked(String),
    #[error("timed out waiting for the in-flight request on this account to finish")]
    LockTimeout,
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Per-user serialization registry: at most one mutating request per user
/// is ever in flight, collapsing the "rapid double click" race the spec
/// calls out explicitly (§4.8 scenario 1) without a round trip to the
/// database for every request.
#[derive(Clone, Default)]
struct LockRegistry {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    fn handle_for(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire(&self, user_id: UserId) -> Result<tokio::sync::OwnedMutexGuard<()>, DispatcherError> {
        let handle = self.handle_for(user_id);
        tokio::time::timeout(LOCK_TIMEOUT, handle.lock_owned())
            .await
            .map_err(|_| DispatcherError::LockTimeout)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    cache: Cache,
    locks: LockRegistry,
    idempotency_ttl: Duration,
}

impl Dispatcher {
    pub fn new(cache: Cache, idempotency_ttl: Duration) -> Self {
        Self {
            cache,
            locks: LockRegistry::default(),
            idempotency_ttl,
        }
    }

    /// Reject any field in `body` not present in `allowed` before the
    /// request reaches typed deserialization (spec §4.8 scenario 3: mass
    /// assignment on a join request trying to set its own bet amount).
    pub fn enforce_field_whitelist(
        &self,
        body: &serde_json::Value,
        allowed: &[&'static str],
    ) -> Result<(), DispatcherError> {
        check_field_whitelist(body, allowed)
    }

    /// Run `operation` under the full dispatcher envelope: idempotency
    /// replay/record, then the per-user lock, then the caller's closure.
    /// `operation` should perform the ledger/scheduler call and event
    /// publication; its `Ok` response is what gets cached for replay.
    pub async fn dispatch<T, F, Fut>(
        &self,
        user_id: UserId,
        client_key: &str,
        operation: F,
    ) -> Result<T, DispatcherError>
    where
        T: Serialize + serde::de::DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, DispatcherError>>,
    {
        validate_idempotency_key(client_key).map_err(DispatcherError::InvalidIdempotencyKey)?;

        if let Some(cached) = idempotency::lookup::<T>(&self.cache, user_id, client_key).await {
            return Ok(cached);
        }

        let _guard = self.locks.acquire(user_id).await?;

        // Re-check after acquiring the lock: a concurrent request for the
        // same key may have completed and cached its result while we
        // waited (spec §4.8 scenario 1, the rapid-click race).
        if let Some(cached) = idempotency::lookup::<T>(&self.cache, user_id, client_key).await {
            return Ok(cached);
        }

        let result = operation().await?;
        idempotency::store(&self.cache, user_id, client_key, self.idempotency_ttl, &result).await;
        Ok(result)
    }
}

fn check_field_whitelist(
    body: &serde_json::Value,
    allowed: &[&'static str],
) -> Result<(), DispatcherError> {
    let serde_json::Value::Object(map) = body else {
        return Ok(());
    };
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(DispatcherError::MassAssignmentBlocked(key.clone()));
        }
    }
    Ok(())
}

/// Join/leave convenience wrappers composing a [`Dispatcher`] with a room's
/// [`SchedulerHandle`]; kept separate from `Dispatcher` itself so the
/// dispatcher stays agnostic of which scheduler a given room uses.
pub async fn join_room(
    dispatcher: &Dispatcher,
    scheduler: &SchedulerHandle,
    user_id: UserId,
    client_key: &str,
    bet_amount: Decimal,
    client_fingerprint: String,
) -> Result<(), DispatcherError> {
    dispatcher
        .dispatch(user_id, client_key, || async {
            scheduler
                .join(user_id, bet_amount, client_fingerprint)
                .await
                .map_err(DispatcherError::from)
        })
        .await
}

pub async fn leave_room(
    dispatcher: &Dispatcher,
    scheduler: &SchedulerHandle,
    user_id: UserId,
    client_key: &str,
) -> Result<(), DispatcherError> {
    dispatcher
        .dispatch(user_id, client_key, || async {
            scheduler.leave(user_id).await.map_err(DispatcherError::from)
        })
        .await
}

/// Field whitelists per mutating endpoint (spec §4.8 scenario 3). Declared
/// once here rather than inline in handlers so the boundary is auditable
/// in one place.
pub mod whitelists {
    pub const JOIN_ROOM: &[&str] = &["idempotencyKey", "clientFingerprint"];
    pub const LEAVE_ROOM: &[&str] = &["idempotencyKey"];
    pub const ADMIN_ADJUST: &[&str] = &["idempotencyKey", "userId", "delta", "description"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_accepts_listed_fields_only() {
        let body = serde_json::json!({
            "idempotencyKey": "0123456789abcdef",
            "clientFingerprint": "abc",
        });
        assert!(check_field_whitelist(&body, whitelists::JOIN_ROOM).is_ok());
    }

    #[test]
    fn whitelist_rejects_bet_amount_on_join() {
        let body = serde_json::json!({
            "idempotencyKey": "0123456789abcdef",
            "clientFingerprint": "abc",
            "betAmount": "1000.00",
        });
        let err = check_field_whitelist(&body, whitelists::JOIN_ROOM).unwrap_err();
        assert!(matches!(err, DispatcherError::MassAssignmentBlocked(field) if field == "betAmount"));
    }

    #[test]
    fn whitelist_ignores_non_object_bodies() {
        assert!(check_field_whitelist(&serde_json::json!(null), whitelists::JOIN_ROOM).is_ok());
    }
}
