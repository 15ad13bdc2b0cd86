//! Idempotency Key Store
//!
//! Reservation and record creation are one store insert, so the uniqueness
//! of `(owner_id, idempotency_key)` among live records is enforced by the
//! store itself. Keys of FAILED records are free again.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::LedgerError;
use super::store::{InsertOutcome, LedgerStore};
use super::types::LedgerRecord;

/// Result of reserving an idempotency key
#[derive(Debug, Clone)]
pub enum Reservation {
    /// Key was free; the candidate record is now stored and the caller proceeds
    Created(LedgerRecord),
    /// Same key, same payload: the caller must not re-execute side effects
    Existing(LedgerRecord),
}

impl Reservation {
    pub fn record(&self) -> &LedgerRecord {
        match self {
            Reservation::Created(r) | Reservation::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> LedgerRecord {
        match self {
            Reservation::Created(r) | Reservation::Existing(r) => r,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Reservation::Existing(_))
    }
}

pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Reserve the candidate's `(owner_id, idempotency_key)`.
    ///
    /// Fails with `IdempotencyConflict` when a live record holds the key
    /// with a different request fingerprint.
    pub async fn reserve(&self, candidate: LedgerRecord) -> Result<Reservation, LedgerError> {
        let fingerprint = candidate.request_fingerprint.clone();
        match self.store.insert(candidate).await? {
            InsertOutcome::Inserted(record) => Ok(Reservation::Created(record)),
            InsertOutcome::Duplicate(existing) if existing.request_fingerprint == fingerprint => {
                debug!(
                    record_id = %existing.id,
                    owner_id = %existing.owner_id,
                    key = %existing.idempotency_key,
                    "Idempotent replay"
                );
                Ok(Reservation::Existing(existing))
            }
            InsertOutcome::Duplicate(existing) => {
                warn!(
                    record_id = %existing.id,
                    owner_id = %existing.owner_id,
                    key = %existing.idempotency_key,
                    "Idempotency key reused with a different payload"
                );
                Err(LedgerError::IdempotencyConflict {
                    key: existing.idempotency_key.clone(),
                    existing: existing.id,
                })
            }
        }
    }
}
