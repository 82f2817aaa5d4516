//! Core error kinds and the single place they are translated to the
//! player-facing error envelope (spec §6/§7).
//!
//! Every core component returns one of the component-specific error enums
//! below. `EngineError` aggregates them for handlers that can fail in more
//! than one component's way. Only `handlers`/`dispatcher` ever convert an
//! `EngineError` into an HTTP response; nothing below this line leaks a
//! stack trace, SQL text, or seed material.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::dispatcher::DispatcherError;
use crate::ledger::LedgerError;
use crate::oracle::OracleError;
use crate::scheduler::SchedulerError;
use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("room is not joinable")]
    RoomNotJoinable,
    #[error("not currently participating")]
    NotParticipating,
    #[error("room is locked past Waiting")]
    RoomLocked,
    #[error("user not found")]
    UserNotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("mass assignment blocked: field {0:?} is not permitted on this endpoint")]
    MassAssignmentBlocked(String),
    #[error("account is locked")]
    AccountLocked,
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "statusCode")]
    status_code: u16,
    error: ErrorBody,
}

impl EngineError {
    /// Unwraps the `SchedulerError` this carries, whether it arrived
    /// directly or through the dispatcher's own `#[from]` wrapping. The two
    /// scheduler variants that are ordinary player-facing outcomes
    /// (`AlreadyParticipating`, `NotJoinable`) need the same typed response
    /// regardless of which path they came in on.
    fn scheduler_cause(&self) -> Option<&SchedulerError> {
        match self {
            EngineError::Scheduler(e) => Some(e),
            EngineError::Dispatcher(DispatcherError::Scheduler(e)) => Some(e),
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self.scheduler_cause() {
            Some(SchedulerError::AlreadyParticipating) => return "ALREADY_PARTICIPATING",
            Some(SchedulerError::NotJoinable) => return "ROOM_NOT_JOINABLE",
            _ => {}
        }
        match self {
            EngineError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            EngineError::RoomNotJoinable | EngineError::RoomLocked => "ROOM_NOT_JOINABLE",
            EngineError::NotParticipating => "VALIDATION",
            EngineError::UserNotFound => "VALIDATION",
            EngineError::Validation(_) => "VALIDATION",
            EngineError::MassAssignmentBlocked(_) => "MASS_ASSIGNMENT_BLOCKED",
            EngineError::AccountLocked => "ACCOUNT_LOCKED",
            EngineError::Session(_) => "ACCOUNT_LOCKED",
            EngineError::Ledger(_) | EngineError::Oracle(_) | EngineError::Scheduler(_) => {
                "INTERNAL_ERROR"
            }
            EngineError::Dispatcher(d) => match d {
                DispatcherError::InvalidIdempotencyKey(_) => "VALIDATION",
                DispatcherError::MassAssignmentBlocked(_) => "MASS_ASSIGNMENT_BLOCKED",
                DispatcherError::LockTimeout => "RATE_LIMITED",
                DispatcherError::Scheduler(_) | DispatcherError::Ledger(_) => "INTERNAL_ERROR",
            },
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        if matches!(
            self.scheduler_cause(),
            Some(SchedulerError::AlreadyParticipating) | Some(SchedulerError::NotJoinable)
        ) {
            return StatusCode::CONFLICT;
        }
        match self {
            EngineError::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::RoomNotJoinable
            | EngineError::RoomLocked
            | EngineError::NotParticipating => StatusCode::CONFLICT,
            EngineError::UserNotFound | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::MassAssignmentBlocked(_) => StatusCode::BAD_REQUEST,
            EngineError::AccountLocked | EngineError::Session(_) => StatusCode::UNAUTHORIZED,
            EngineError::Ledger(_) | EngineError::Oracle(_) | EngineError::Scheduler(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Dispatcher(d) => match d {
                DispatcherError::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,
                DispatcherError::MassAssignmentBlocked(_) => StatusCode::BAD_REQUEST,
                DispatcherError::LockTimeout => StatusCode::TOO_MANY_REQUESTS,
                DispatcherError::Scheduler(_) | DispatcherError::Ledger(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Sensitive detail (SQL text,
    /// unrevealed seed material) stays behind `tracing::error!` and never
    /// reaches this string.
    fn public_message(&self) -> String {
        if matches!(
            self.scheduler_cause(),
            Some(SchedulerError::AlreadyParticipating) | Some(SchedulerError::NotJoinable)
        ) {
            return self.to_string();
        }
        match self {
            EngineError::Ledger(_) | EngineError::Oracle(_) | EngineError::Scheduler(_) => {
                "an internal error occurred".to_string()
            }
            EngineError::Dispatcher(DispatcherError::Scheduler(_))
            | EngineError::Dispatcher(DispatcherError::Ledger(_)) => {
                "an internal error occurred".to_string()
            }
            EngineError::Internal(_) => "an internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let ordinary_scheduler_outcome = matches!(
            self.scheduler_cause(),
            Some(SchedulerError::AlreadyParticipating) | Some(SchedulerError::NotJoinable)
        );
        let is_internal_invariant = !ordinary_scheduler_outcome
            && matches!(
                self,
                EngineError::Ledger(_)
                    | EngineError::Oracle(_)
                    | EngineError::Scheduler(_)
                    | EngineError::Dispatcher(DispatcherError::Scheduler(_))
                    | EngineError::Dispatcher(DispatcherError::Ledger(_))
            );
        if is_internal_invariant {
            tracing::error!(error = %self, "internal invariant surfaced to caller");
        }

        let status = self.status();
        let envelope = ErrorEnvelope {
            status_code: status.as_u16(),
            error: ErrorBody {
                code: self.code(),
                message: self.public_message(),
            },
        };
        (status, Json(envelope)).into_response()
    }
}
