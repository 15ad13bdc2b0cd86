//! Ledger Record Store
//!
//! `compare_and_swap_state` is the only mutation path for an existing record.
//! Records are never deleted.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::error::LedgerError;
use super::state::LedgerState;
use super::types::{LedgerRecord, LedgerRecordId, OwnerId, RecordPatch};

/// Outcome of inserting a new record
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The record was stored
    Inserted(LedgerRecord),
    /// A non-failed record with the same `(owner_id, idempotency_key)` already exists
    Duplicate(LedgerRecord),
}

/// Durable store of ledger records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Must be atomic with respect to concurrent inserts carrying the same
    /// `(owner_id, idempotency_key)`: exactly one of them is `Inserted`.
    async fn insert(&self, record: LedgerRecord) -> Result<InsertOutcome, LedgerError>;

    /// Fails with `NotFound` for an unknown id.
    async fn get(&self, id: LedgerRecordId) -> Result<LedgerRecord, LedgerError>;

    async fn find_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<LedgerRecord>, LedgerError>;

    /// Move `id` from `expected` to `new_state`, applying `patch` in the same write.
    ///
    /// Fails with `StateConflict` carrying the current state when the record
    /// is no longer in `expected`.
    async fn compare_and_swap_state(
        &self,
        id: LedgerRecordId,
        expected: LedgerState,
        new_state: LedgerState,
        patch: &RecordPatch,
    ) -> Result<LedgerRecord, LedgerError>;

    /// Owner's records, newest first.
    async fn list_by_owner(
        &self,
        owner: &OwnerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;

    async fn count_by_owner(&self, owner: &OwnerId) -> Result<u64, LedgerError>;

    /// All COMPLETED records of an owner, oldest completion first.
    async fn completed_for_owner(&self, owner: &OwnerId) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// PENDING records whose deadline is at or before `now`.
    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// Records in `state` not touched since `updated_before`.
    async fn find_stale(
        &self,
        state: LedgerState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<LedgerRecordId, LedgerRecord>,
    /// Live (non-failed) record per idempotency key
    by_key: HashMap<(OwnerId, String), LedgerRecordId>,
    by_external_ref: HashMap<String, LedgerRecordId>,
}

/// In-process store used when no database is configured, and by tests
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

fn newest_first(records: &mut [LedgerRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert(&self, record: LedgerRecord) -> Result<InsertOutcome, LedgerError> {
        let mut inner = self.inner.write().await;

        let key = (record.owner_id.clone(), record.idempotency_key.clone());
        if let Some(existing_id) = inner.by_key.get(&key) {
            let existing = inner
                .records
                .get(existing_id)
                .cloned()
                .ok_or_else(|| LedgerError::Storage("idempotency index out of sync".into()))?;
            return Ok(InsertOutcome::Duplicate(existing));
        }

        if record.state != LedgerState::Failed {
            inner.by_key.insert(key, record.id);
        }
        if let Some(reference) = &record.external_reference {
            inner.by_external_ref.insert(reference.clone(), record.id);
        }
        inner.records.insert(record.id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get(&self, id: LedgerRecordId) -> Result<LedgerRecord, LedgerError> {
        self.inner
            .read()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::record_not_found(&id))
    }

    async fn find_by_external_reference(
        &self,
        reference: &str,
    ) -> Result<Option<LedgerRecord>, LedgerError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_external_ref
            .get(reference)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn compare_and_swap_state(
        &self,
        id: LedgerRecordId,
        expected: LedgerState,
        new_state: LedgerState,
        patch: &RecordPatch,
    ) -> Result<LedgerRecord, LedgerError> {
        let mut inner = self.inner.write().await;

        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| LedgerError::record_not_found(&id))?;
        if record.state != expected {
            return Err(LedgerError::StateConflict {
                id,
                current: record.state,
            });
        }

        patch.apply(record, new_state, Utc::now());
        let updated = record.clone();

        if let Some(reference) = &updated.external_reference {
            inner.by_external_ref.insert(reference.clone(), id);
        }
        if new_state == LedgerState::Failed {
            let key = (updated.owner_id.clone(), updated.idempotency_key.clone());
            if inner.by_key.get(&key) == Some(&id) {
                inner.by_key.remove(&key);
            }
        }

        Ok(updated)
    }

    async fn list_by_owner(
        &self,
        owner: &OwnerId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        let inner = self.inner.read().await;
        let mut records: Vec<LedgerRecord> = inner
            .records
            .values()
            .filter(|r| &r.owner_id == owner)
            .cloned()
            .collect();
        newest_first(&mut records);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_owner(&self, owner: &OwnerId) -> Result<u64, LedgerError> {
        let inner = self.inner.read().await;
        Ok(inner.records.values().filter(|r| &r.owner_id == owner).count() as u64)
    }

    async fn completed_for_owner(&self, owner: &OwnerId) -> Result<Vec<LedgerRecord>, LedgerError> {
        let inner = self.inner.read().await;
        let mut records: Vec<LedgerRecord> = inner
            .records
            .values()
            .filter(|r| &r.owner_id == owner && r.state == LedgerState::Completed)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.completed_at.cmp(&b.completed_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        let inner = self.inner.read().await;
        let mut records: Vec<LedgerRecord> = inner
            .records
            .values()
            .filter(|r| {
                r.state == LedgerState::Pending && r.pending_deadline.is_some_and(|d| d <= now)
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.pending_deadline);
        records.truncate(limit);
        Ok(records)
    }

    async fn find_stale(
        &self,
        state: LedgerState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        let inner = self.inner.read().await;
        let mut records: Vec<LedgerRecord> = inner
            .records
            .values()
            .filter(|r| r.state == state && r.updated_at < updated_before)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        records.truncate(limit);
        Ok(records)
    }
}
