//! Ledger Error Types

use thiserror::Error;

use super::state::{LedgerEvent, LedgerState};
use super::types::LedgerRecordId;
use crate::gateway::GatewayError;
use crate::money::MoneyError;

/// Ledger error types
///
/// `code()` values are stable and appear in API error responses.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Caller Errors ===
    #[error("User not authenticated")]
    Unauthorized,

    #[error("Record belongs to another owner")]
    Forbidden,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error("Idempotency key '{key}' was already used with a different payload")]
    IdempotencyConflict { key: String, existing: LedgerRecordId },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Event {event} is not allowed from state {from}")]
    InvalidTransition {
        from: LedgerState,
        event: LedgerEvent,
    },

    // === Internal Races ===
    #[error("State conflict on {id}: record is now {current}")]
    StateConflict {
        id: LedgerRecordId,
        current: LedgerState,
    },

    // === Gateway ===
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Malformed callback: {0}")]
    MalformedCallback(String),

    // === System Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Unauthorized => "UNAUTHORIZED",
            LedgerError::Forbidden => "FORBIDDEN",
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::StateConflict { .. } => "STATE_CONFLICT",
            LedgerError::Gateway(_) => "GATEWAY_ERROR",
            LedgerError::MalformedCallback(_) => "MALFORMED_CALLBACK",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::Validation(_)
            | LedgerError::InvalidAmount(_)
            | LedgerError::MalformedCallback(_) => 400,
            LedgerError::Unauthorized => 401,
            LedgerError::Forbidden => 403,
            LedgerError::NotFound(_) => 404,
            LedgerError::IdempotencyConflict { .. } | LedgerError::InvalidTransition { .. } => 409,
            LedgerError::Gateway(e) if e.is_transient() => 503,
            LedgerError::Gateway(_) => 502,
            LedgerError::StateConflict { .. } | LedgerError::Storage(_) => 500,
            LedgerError::ServiceUnavailable(_) => 503,
        }
    }

    /// Not-found helper for record ids.
    pub fn record_not_found(id: &LedgerRecordId) -> Self {
        LedgerError::NotFound(format!("ledger record {}", id))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            LedgerError::IdempotencyConflict {
                key: "K1".into(),
                existing: LedgerRecordId::new()
            }
            .code(),
            "IDEMPOTENCY_CONFLICT"
        );
        assert_eq!(
            LedgerError::MalformedCallback("bad".into()).code(),
            "MALFORMED_CALLBACK"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::Unauthorized.http_status(), 401);
        assert_eq!(LedgerError::Forbidden.http_status(), 403);
        assert_eq!(LedgerError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            LedgerError::InvalidAmount(MoneyError::InvalidAmount).http_status(),
            400
        );
        assert_eq!(
            LedgerError::Gateway(GatewayError::Rejected("insufficient funds".into())).http_status(),
            502
        );
        assert_eq!(
            LedgerError::Gateway(GatewayError::Unreachable("connect refused".into())).http_status(),
            503
        );
        assert_eq!(
            LedgerError::Gateway(GatewayError::Timeout).http_status(),
            503
        );
        assert_eq!(
            LedgerError::Gateway(GatewayError::Indeterminate("HTTP 504".into())).http_status(),
            503
        );
    }

    #[test]
    fn test_display() {
        let err = LedgerError::InvalidTransition {
            from: LedgerState::Pending,
            event: LedgerEvent::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "Event cancel is not allowed from state PENDING"
        );
    }
}
