//! Ledger State Machine Engine
//!
//! Drives records through `CREATED → SUBMITTED → PENDING → COMPLETED | FAILED`.
//! Every state change goes through [`LedgerEngine::transition`], which is a
//! compare-and-swap on the store. The balance effect of a COMPLETED record is
//! applied only by the caller whose swap succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tracing::{debug, error, info, warn};

use super::error::LedgerError;
use super::idempotency::{IdempotencyGuard, Reservation};
use super::projector::{BalanceProjector, BalanceSnapshot, Entitlements, StatsPeriod, TransferStats};
use super::state::{LedgerEvent, LedgerState, Transition};
use super::store::LedgerStore;
use super::types::{
    Direction, LedgerRecord, LedgerRecordId, OwnerId, RecordKind, RecordPatch, TransferRequest,
};
use crate::catalog::PlanCatalog;
use crate::gateway::{
    CallbackOutcome, GatewayAcceptance, GatewayError, InitiateRequest, Outcome, PaymentGateway,
};
use crate::msisdn::normalize_msisdn;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const MAX_DESTINATION_LEN: usize = 64;
const MAX_BANK_ACCOUNT_ID_LEN: usize = 64;

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a PENDING record may wait for its callback
    pub pending_sla: Duration,
    /// Total `initiate` attempts for retryable gateway errors
    pub max_initiate_attempts: u32,
    /// Linear backoff step between `initiate` attempts
    pub initiate_backoff: Duration,
    /// CAS attempts before a transition gives up
    pub max_transition_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_sla: Duration::from_secs(180),
            max_initiate_attempts: 3,
            initiate_backoff: Duration::from_millis(500),
            max_transition_retries: 5,
        }
    }
}

/// Result of `create`
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub record: LedgerRecord,
    /// Same key and payload as an earlier request; nothing was executed
    pub replayed: bool,
    /// Set when the gateway refused or could not be reached; the record is FAILED
    pub gateway_error: Option<GatewayError>,
}

/// Result of `transition`
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub record: LedgerRecord,
    /// False when the event was ignored or another caller won the race
    pub applied: bool,
}

pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    guard: IdempotencyGuard,
    gateway: Arc<dyn PaymentGateway>,
    projector: BalanceProjector,
    catalog: Arc<PlanCatalog>,
    config: EngineConfig,
    /// Records whose `initiate` call is in progress
    in_flight: DashSet<LedgerRecordId>,
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            projector: BalanceProjector::new(store.clone()),
            store,
            gateway,
            catalog,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn with_defaults(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self::new(store, gateway, catalog, EngineConfig::default())
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn projector(&self) -> &BalanceProjector {
        &self.projector
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a record and hand it to the gateway.
    ///
    /// A replay (same owner, key and payload) returns the existing record
    /// without touching the gateway.
    pub async fn create(&self, req: TransferRequest) -> Result<CreateOutcome, LedgerError> {
        let req = self.validate(req)?;
        let candidate = LedgerRecord::new(&req, Utc::now());

        let record = match self.guard.reserve(candidate).await? {
            Reservation::Existing(existing) => {
                info!(
                    record_id = %existing.id,
                    owner_id = %existing.owner_id,
                    state = %existing.state,
                    "Replayed transfer request"
                );
                return Ok(CreateOutcome {
                    record: existing,
                    replayed: true,
                    gateway_error: None,
                });
            }
            Reservation::Created(record) => record,
        };

        info!(
            record_id = %record.id,
            owner_id = %record.owner_id,
            kind = %record.kind,
            direction = %record.direction,
            amount = %record.amount,
            "Ledger record created"
        );

        let id = record.id;
        self.in_flight.insert(id);
        let submitted = self.submit(record).await;
        self.in_flight.remove(&id);
        let (record, gateway_error) = submitted?;

        Ok(CreateOutcome {
            record,
            replayed: false,
            gateway_error,
        })
    }

    fn validate(&self, mut req: TransferRequest) -> Result<TransferRequest, LedgerError> {
        req.idempotency_key = req.idempotency_key.trim().to_string();
        if req.idempotency_key.is_empty() {
            return Err(LedgerError::Validation("idempotencyKey is required".into()));
        }
        if req.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(LedgerError::Validation(format!(
                "idempotencyKey longer than {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        req.destination = req.destination.trim().to_string();
        if req.destination.is_empty() {
            return Err(LedgerError::Validation("destination is required".into()));
        }
        if req.destination.len() > MAX_DESTINATION_LEN {
            return Err(LedgerError::Validation("destination is too long".into()));
        }

        // The gateway call fixes which way money moves for each kind
        let expected = req.kind.default_direction();
        if req.direction != expected {
            return Err(LedgerError::Validation(format!(
                "{} records are always {}s",
                req.kind, expected
            )));
        }

        req.destination = normalize_msisdn(&req.destination)
            .map_err(|e| LedgerError::Validation(e.to_string()))?;

        match req.kind {
            RecordKind::MobileMoneyPush => {}
            RecordKind::ServicePurchase => {
                let plan_id = req
                    .metadata
                    .get("planId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LedgerError::Validation("metadata.planId is required".into()))?;
                let plan = self
                    .catalog
                    .get(plan_id)
                    .ok_or_else(|| LedgerError::Validation(format!("unknown plan '{}'", plan_id)))?;
                if plan.price != req.amount.value() {
                    return Err(LedgerError::Validation(format!(
                        "plan '{}' costs {}, got {}",
                        plan.id, plan.price, req.amount
                    )));
                }
            }
            RecordKind::BankTransfer => {
                // Payout goes to the M-Pesa number linked to the bank account
                let account = req
                    .metadata
                    .get("bankAccountId")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .unwrap_or_default();
                if account.is_empty() || account.len() > MAX_BANK_ACCOUNT_ID_LEN {
                    return Err(LedgerError::Validation(
                        "metadata.bankAccountId is required".into(),
                    ));
                }
            }
        }
        Ok(req)
    }

    fn initiate_request(record: &LedgerRecord) -> InitiateRequest {
        let id = record.id.to_string();
        let description = record
            .metadata_str("description")
            .map(str::to_string)
            .unwrap_or_else(|| match record.kind {
                RecordKind::ServicePurchase => "Plan purchase".to_string(),
                RecordKind::BankTransfer => "Bank transfer".to_string(),
                RecordKind::MobileMoneyPush => "Wallet top-up".to_string(),
            });
        InitiateRequest {
            record_id: record.id,
            kind: record.kind,
            direction: record.direction,
            amount: record.amount,
            destination: record.destination.clone(),
            reference: format!("MP{}", &id[id.len().saturating_sub(10)..]),
            description,
        }
    }

    async fn initiate_with_retry(
        &self,
        req: &InitiateRequest,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let max_attempts = self.config.max_initiate_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.gateway.initiate(req).await {
                Ok(acceptance) => return Ok(acceptance),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        record_id = %req.record_id,
                        attempt,
                        error = %e,
                        "Gateway initiate failed, retrying"
                    );
                    tokio::time::sleep(self.config.initiate_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Call the gateway for a CREATED record and record the answer.
    async fn submit(
        &self,
        record: LedgerRecord,
    ) -> Result<(LedgerRecord, Option<GatewayError>), LedgerError> {
        let req = Self::initiate_request(&record);

        let acceptance = match self.initiate_with_retry(&req).await {
            Ok(acceptance) => acceptance,
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    gateway = self.gateway.name(),
                    error = %e,
                    "Gateway initiate failed"
                );
                let failed = self
                    .transition(
                        record.id,
                        LedgerEvent::GatewayRejected,
                        RecordPatch::new().error(e.to_string()),
                    )
                    .await?;
                return Ok((failed.record, Some(e)));
            }
        };

        let submitted = self
            .transition(
                record.id,
                LedgerEvent::GatewayAccepted,
                RecordPatch::new()
                    .external_reference(acceptance.external_reference.clone())
                    .metadata("gateway", self.gateway.name()),
            )
            .await?;

        if !submitted.applied {
            // Cancelled while the gateway call was in progress
            error!(
                record_id = %record.id,
                external_reference = %acceptance.external_reference,
                state = %submitted.record.state,
                "Gateway accepted a record that is no longer CREATED"
            );
            return Ok((submitted.record, None));
        }

        if !acceptance.queued {
            return Ok((submitted.record, None));
        }

        let pending = self.acknowledge(record.id).await?;
        Ok((pending.record, None))
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Apply `event` to record `id` through compare-and-swap.
    ///
    /// Terminal records ignore every event. When another caller moves the
    /// record first, the loser re-reads and returns the current record with
    /// `applied == false` instead of failing.
    pub async fn transition(
        &self,
        id: LedgerRecordId,
        event: LedgerEvent,
        patch: RecordPatch,
    ) -> Result<Transitioned, LedgerError> {
        let mut current = self.store.get(id).await?;
        let mut raced = false;

        for _ in 0..self.config.max_transition_retries.max(1) {
            let next = match current.state.on(event) {
                Transition::Move(next) => next,
                Transition::Ignore => {
                    debug!(
                        record_id = %id,
                        state = %current.state,
                        event = %event,
                        "Event ignored by terminal record"
                    );
                    return Ok(Transitioned {
                        record: current,
                        applied: false,
                    });
                }
                Transition::Invalid if raced => {
                    debug!(
                        record_id = %id,
                        state = %current.state,
                        event = %event,
                        "Record moved by a concurrent caller"
                    );
                    return Ok(Transitioned {
                        record: current,
                        applied: false,
                    });
                }
                Transition::Invalid => {
                    return Err(LedgerError::InvalidTransition {
                        from: current.state,
                        event,
                    });
                }
            };

            match self
                .store
                .compare_and_swap_state(id, current.state, next, &patch)
                .await
            {
                Ok(updated) => {
                    info!(
                        record_id = %id,
                        from = %current.state,
                        to = %updated.state,
                        event = %event,
                        "Ledger record transitioned"
                    );
                    if updated.state == LedgerState::Completed {
                        self.apply_completion(&updated).await;
                    }
                    return Ok(Transitioned {
                        record: updated,
                        applied: true,
                    });
                }
                Err(LedgerError::StateConflict { current: now, .. }) => {
                    debug!(
                        record_id = %id,
                        expected = %current.state,
                        actual = %now,
                        event = %event,
                        "CAS conflict, re-reading"
                    );
                    raced = true;
                    current = self.store.get(id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(LedgerError::StateConflict {
            id,
            current: current.state,
        })
    }

    async fn apply_completion(&self, record: &LedgerRecord) {
        if let Err(e) = self.projector.apply_effect(record).await {
            // The ledger is already correct; the next read rebuilds the projection.
            error!(
                record_id = %record.id,
                owner_id = %record.owner_id,
                error = %e,
                "Failed to apply balance effect"
            );
            self.projector.invalidate(&record.owner_id);
        }
    }

    /// SUBMITTED → PENDING, starting the SLA clock.
    pub async fn acknowledge(&self, id: LedgerRecordId) -> Result<Transitioned, LedgerError> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.pending_sla)
                .unwrap_or_else(|_| chrono::Duration::seconds(180));
        self.transition(
            id,
            LedgerEvent::GatewayQueued,
            RecordPatch::new().pending_deadline(deadline),
        )
        .await
    }

    /// Apply a verified gateway callback.
    ///
    /// Callbacks for terminal records are no-ops that return the record.
    pub async fn apply_callback(
        &self,
        outcome: &CallbackOutcome,
    ) -> Result<LedgerRecord, LedgerError> {
        let record = self
            .store
            .find_by_external_reference(&outcome.external_reference)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "no record for external reference {}",
                    outcome.external_reference
                ))
            })?;

        if record.state.is_terminal() {
            info!(
                record_id = %record.id,
                external_reference = %outcome.external_reference,
                state = %record.state,
                "Duplicate callback for terminal record"
            );
            return Ok(record);
        }

        if outcome.outcome == Outcome::Success
            && let Some(settled) = outcome.settled_amount
            && settled != record.amount.value()
        {
            return Err(LedgerError::MalformedCallback(format!(
                "settled amount {} does not match record amount {}",
                settled, record.amount
            )));
        }

        if record.state == LedgerState::Submitted {
            debug!(record_id = %record.id, "Callback before queued ack, acknowledging");
            self.acknowledge(record.id).await?;
        }

        let mut patch = RecordPatch::new();
        if let Some(receipt) = &outcome.receipt {
            patch = patch.metadata("receipt", receipt.as_str());
        }
        if let Some(description) = &outcome.description {
            patch = patch.metadata("resultDescription", description.as_str());
        }
        let event = match outcome.outcome {
            Outcome::Success => LedgerEvent::CallbackSucceeded,
            Outcome::Failure => {
                patch = patch.error(
                    outcome
                        .description
                        .clone()
                        .unwrap_or_else(|| "gateway reported failure".to_string()),
                );
                LedgerEvent::CallbackFailed
            }
        };

        Ok(self.transition(record.id, event, patch).await?.record)
    }

    /// PENDING → FAILED after the SLA ran out.
    pub async fn expire(&self, id: LedgerRecordId) -> Result<Transitioned, LedgerError> {
        self.transition(
            id,
            LedgerEvent::TimedOut,
            RecordPatch::new()
                .metadata("timedOut", true)
                .error("no callback within SLA"),
        )
        .await
    }

    /// CREATED → FAILED for a record the gateway never saw.
    ///
    /// Returns `applied == false` while an `initiate` call for it is running.
    pub async fn abandon(
        &self,
        id: LedgerRecordId,
        reason: &str,
    ) -> Result<Transitioned, LedgerError> {
        if self.in_flight.contains(&id) {
            return Ok(Transitioned {
                record: self.store.get(id).await?,
                applied: false,
            });
        }
        self.transition(id, LedgerEvent::Cancelled, RecordPatch::new().error(reason))
            .await
    }

    /// Owner-requested cancellation; only CREATED records can be cancelled.
    pub async fn cancel(
        &self,
        owner: &OwnerId,
        id: LedgerRecordId,
    ) -> Result<LedgerRecord, LedgerError> {
        let record = self.get_for_owner(owner, id).await?;
        if record.state != LedgerState::Created || self.in_flight.contains(&id) {
            return Err(LedgerError::InvalidTransition {
                from: record.state,
                event: LedgerEvent::Cancelled,
            });
        }

        let result = self.abandon(id, "cancelled by owner").await?;
        if result.record.state != LedgerState::Failed {
            return Err(LedgerError::InvalidTransition {
                from: result.record.state,
                event: LedgerEvent::Cancelled,
            });
        }
        info!(record_id = %id, owner_id = %owner, "Ledger record cancelled");
        Ok(result.record)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Fetch a record on behalf of `owner`.
    pub async fn get_for_owner(
        &self,
        owner: &OwnerId,
        id: LedgerRecordId,
    ) -> Result<LedgerRecord, LedgerError> {
        let record = self.store.get(id).await?;
        if &record.owner_id != owner {
            warn!(record_id = %id, owner_id = %owner, "Record requested by another owner");
            return Err(LedgerError::Forbidden);
        }
        Ok(record)
    }

    /// Owner's records, newest first, plus the total count.
    pub async fn list(
        &self,
        owner: &OwnerId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<LedgerRecord>, u64), LedgerError> {
        let records = self.store.list_by_owner(owner, limit, offset).await?;
        let total = self.store.count_by_owner(owner).await?;
        Ok((records, total))
    }

    pub async fn balance(&self, owner: &OwnerId) -> Result<BalanceSnapshot, LedgerError> {
        self.projector.current_balance(owner).await
    }

    pub async fn entitlements(&self, owner: &OwnerId) -> Result<Entitlements, LedgerError> {
        self.projector
            .entitlements(owner, &self.catalog, Utc::now())
            .await
    }

    pub async fn stats(
        &self,
        owner: &OwnerId,
        period: StatsPeriod,
    ) -> Result<TransferStats, LedgerError> {
        self.projector.stats(owner, period, Utc::now()).await
    }
}
