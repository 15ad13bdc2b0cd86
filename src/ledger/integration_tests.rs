//! Integration Tests for the Ledger FSM
//!
//! Full flows against the in-memory store and the simulated gateway;
//! no database needed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};

use crate::catalog::PlanCatalog;
use crate::gateway::{
    CallbackAuth, CallbackOutcome, CallbackVerifier, Outcome, PaymentGateway, SimulatedGateway,
};
use crate::ledger::callback_queue::{CallbackWorker, callback_channel};
use crate::ledger::engine::{EngineConfig, LedgerEngine};
use crate::ledger::error::LedgerError;
use crate::ledger::projector::BalanceProjector;
use crate::ledger::state::{LedgerEvent, LedgerState};
use crate::ledger::store::{LedgerStore, MemoryLedgerStore};
use crate::ledger::types::{
    Direction, LedgerRecord, OwnerId, RecordKind, RecordPatch, TransferRequest,
};
use crate::ledger::worker::{ExpirySweeper, SweeperConfig};
use crate::money::Amount;

struct TestHarness {
    engine: Arc<LedgerEngine>,
    store: Arc<MemoryLedgerStore>,
    gateway: Arc<SimulatedGateway>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_sla(Duration::from_secs(180))
    }

    fn with_sla(pending_sla: Duration) -> Self {
        Self::with_gateway(
            SimulatedGateway::new(CallbackVerifier::new("test-secret")),
            pending_sla,
        )
    }

    fn with_gateway(gateway: SimulatedGateway, pending_sla: Duration) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(gateway);
        let engine = Arc::new(LedgerEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(PlanCatalog::standard()),
            EngineConfig {
                pending_sla,
                initiate_backoff: Duration::from_millis(1),
                ..EngineConfig::default()
            },
        ));
        Self {
            engine,
            store,
            gateway,
        }
    }

    fn sweeper(&self, reconcile: bool) -> ExpirySweeper {
        ExpirySweeper::new(
            self.engine.clone(),
            SweeperConfig {
                scan_interval: Duration::from_millis(10),
                batch_size: 100,
                reconcile_with_gateway: reconcile,
                abandon_after: Duration::from_secs(600),
            },
        )
    }

    async fn balance(&self, owner: &str) -> Decimal {
        self.engine
            .balance(&OwnerId::from(owner))
            .await
            .unwrap()
            .available_balance
    }
}

fn bank_transfer(owner: &str, key: &str, amount: &str) -> TransferRequest {
    let mut metadata = Map::new();
    metadata.insert("bankAccountId".into(), Value::String("ACC-001".into()));
    TransferRequest {
        owner_id: OwnerId::from(owner),
        idempotency_key: key.to_string(),
        kind: RecordKind::BankTransfer,
        direction: Direction::Debit,
        amount: Amount::parse(amount).unwrap(),
        destination: "254712345678".into(),
        metadata,
    }
}

fn top_up(owner: &str, key: &str, amount: &str) -> TransferRequest {
    TransferRequest {
        owner_id: OwnerId::from(owner),
        idempotency_key: key.to_string(),
        kind: RecordKind::MobileMoneyPush,
        direction: Direction::Credit,
        amount: Amount::parse(amount).unwrap(),
        destination: "+254 712 345 678".into(),
        metadata: Map::new(),
    }
}

fn success(record: &LedgerRecord) -> CallbackOutcome {
    CallbackOutcome {
        external_reference: record.external_reference.clone().unwrap(),
        outcome: Outcome::Success,
        settled_amount: Some(record.amount.value()),
        receipt: Some("NLJ7RT61SV".into()),
        description: Some("The service request is processed successfully.".into()),
    }
}

// ============================================================================
// Walkthrough
// ============================================================================

/// U1 sends 500.00 with key K1; callback completes it; a duplicate callback
/// and a retried request change nothing.
#[tokio::test]
async fn test_bank_transfer_walkthrough() {
    let h = TestHarness::new();

    let created = h.engine.create(bank_transfer("U1", "K1", "500.00")).await.unwrap();
    assert!(!created.replayed);
    let r1 = created.record;
    assert_eq!(r1.state, LedgerState::Pending);
    assert!(r1.external_reference.is_some());
    assert!(r1.pending_deadline.is_some());
    assert!(r1.completed_at.is_none());

    let completed = h.engine.apply_callback(&success(&r1)).await.unwrap();
    assert_eq!(completed.state, LedgerState::Completed);
    assert!(completed.completed_at.is_some());
    assert_eq!(h.balance("U1").await, Decimal::from(-500));

    let again = h.engine.apply_callback(&success(&r1)).await.unwrap();
    assert_eq!(again.state, LedgerState::Completed);
    assert_eq!(h.balance("U1").await, Decimal::from(-500));

    let retried = h.engine.create(bank_transfer("U1", "K1", "500")).await.unwrap();
    assert!(retried.replayed);
    assert_eq!(retried.record.id, r1.id);
    assert_eq!(retried.record.state, LedgerState::Completed);
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.gateway.initiate_count(), 1);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_idempotent_creation_single_effect() {
    let h = TestHarness::new();

    let first = h.engine.create(top_up("U1", "K1", "1000")).await.unwrap();
    let second = h.engine.create(top_up("U1", "K1", "1000")).await.unwrap();
    assert_eq!(first.record.id, second.record.id);
    assert!(second.replayed);
    assert_eq!(h.gateway.initiate_count(), 1);

    h.engine.apply_callback(&success(&first.record)).await.unwrap();
    assert_eq!(h.balance("U1").await, Decimal::from(1000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_with_same_key() {
    let h = TestHarness::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create(top_up("U1", "same-key", "250")).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().record.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.gateway.initiate_count(), 1);
}

#[tokio::test]
async fn test_conflicting_key_rejected() {
    let h = TestHarness::new();

    let first = h.engine.create(bank_transfer("U1", "K1", "500")).await.unwrap();
    let err = h
        .engine
        .create(bank_transfer("U1", "K1", "600"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::IdempotencyConflict { .. }));
    assert_eq!(err.http_status(), 409);

    let untouched = h.store.get(first.record.id).await.unwrap();
    assert_eq!(untouched.amount, Amount::parse("500").unwrap());
    assert_eq!(untouched.state, LedgerState::Pending);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn test_same_key_different_owner_is_independent() {
    let h = TestHarness::new();
    let a = h.engine.create(top_up("U1", "K1", "10")).await.unwrap();
    let b = h.engine.create(top_up("U2", "K1", "10")).await.unwrap();
    assert_ne!(a.record.id, b.record.id);
}

// ============================================================================
// Callbacks
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_callbacks_apply_once() {
    let h = TestHarness::new();
    let record = h
        .engine
        .create(top_up("U1", "K1", "750"))
        .await
        .unwrap()
        .record;
    let outcome = success(&record);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let outcome = outcome.clone();
        handles.push(tokio::spawn(async move {
            engine.apply_callback(&outcome).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().state, LedgerState::Completed);
    }

    assert_eq!(h.balance("U1").await, Decimal::from(750));
    let snapshot = h.engine.balance(&OwnerId::from("U1")).await.unwrap();
    assert_eq!(snapshot.version, 1);
}

#[tokio::test]
async fn test_failure_callback_has_no_effect() {
    let h = TestHarness::new();
    let record = h
        .engine
        .create(top_up("U1", "K1", "750"))
        .await
        .unwrap()
        .record;

    let failed = h
        .engine
        .apply_callback(&CallbackOutcome {
            external_reference: record.external_reference.clone().unwrap(),
            outcome: Outcome::Failure,
            settled_amount: None,
            receipt: None,
            description: Some("Request cancelled by user".into()),
        })
        .await
        .unwrap();
    assert_eq!(failed.state, LedgerState::Failed);
    assert_eq!(failed.error.as_deref(), Some("Request cancelled by user"));
    assert_eq!(h.balance("U1").await, Decimal::ZERO);

    // A late success for the same reference does not resurrect it
    let late = h.engine.apply_callback(&success(&record)).await.unwrap();
    assert_eq!(late.state, LedgerState::Failed);
    assert_eq!(h.balance("U1").await, Decimal::ZERO);
}

#[tokio::test]
async fn test_callback_for_unknown_reference() {
    let h = TestHarness::new();
    let err = h
        .engine
        .apply_callback(&CallbackOutcome {
            external_reference: "ws_CO_UNKNOWN".into(),
            outcome: Outcome::Success,
            settled_amount: None,
            receipt: None,
            description: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_signed_callback_through_queue() {
    let h = TestHarness::new();
    let record = h
        .engine
        .create(top_up("U1", "K1", "1200"))
        .await
        .unwrap()
        .record;

    let (body, signature) = h.gateway.callback_body(&success(&record)).unwrap();
    let parsed = h.gateway.parse_callback(CallbackAuth::signed(&signature), &body).unwrap();

    let (tx, rx) = callback_channel(8);
    let worker = tokio::spawn(CallbackWorker::new(h.engine.clone(), rx).run());
    tx.enqueue(parsed).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    let stored = h.store.get(record.id).await.unwrap();
    assert_eq!(stored.state, LedgerState::Completed);
    assert_eq!(stored.metadata.get("receipt"), Some(&json!("NLJ7RT61SV")));
    assert_eq!(h.balance("U1").await, Decimal::from(1200));
}

#[tokio::test]
async fn test_auto_settle_completes_through_worker() {
    let (tx, rx) = callback_channel(8);
    let gateway = SimulatedGateway::new(CallbackVerifier::new("test-secret"))
        .with_auto_settle(Duration::from_millis(20), tx);
    let h = TestHarness::with_gateway(gateway, Duration::from_secs(180));
    tokio::spawn(CallbackWorker::new(h.engine.clone(), rx).run());

    let record = h
        .engine
        .create(top_up("U1", "K1", "300"))
        .await
        .unwrap()
        .record;

    let mut state = record.state;
    for _ in 0..100 {
        state = h.store.get(record.id).await.unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, LedgerState::Completed);
    assert_eq!(h.balance("U1").await, Decimal::from(300));
}

// ============================================================================
// Terminal Immutability
// ============================================================================

#[tokio::test]
async fn test_terminal_records_ignore_every_event() {
    let h = TestHarness::new();
    let done = h
        .engine
        .create(top_up("U1", "K1", "100"))
        .await
        .unwrap()
        .record;
    h.engine.apply_callback(&success(&done)).await.unwrap();

    h.gateway
        .fail_next_initiate(crate::gateway::GatewayError::Rejected("limit".into()));
    let failed = h
        .engine
        .create(top_up("U1", "K2", "100"))
        .await
        .unwrap()
        .record;
    assert_eq!(failed.state, LedgerState::Failed);

    let events = [
        LedgerEvent::GatewayAccepted,
        LedgerEvent::GatewayRejected,
        LedgerEvent::GatewayQueued,
        LedgerEvent::CallbackSucceeded,
        LedgerEvent::CallbackFailed,
        LedgerEvent::TimedOut,
        LedgerEvent::Cancelled,
    ];
    for (id, expected) in [
        (done.id, LedgerState::Completed),
        (failed.id, LedgerState::Failed),
    ] {
        let before = h.store.get(id).await.unwrap();
        for event in events {
            let result = h
                .engine
                .transition(id, event, RecordPatch::new().error("late"))
                .await
                .unwrap();
            assert!(!result.applied);
            assert_eq!(result.record.state, expected);
        }
        let after = h.store.get(id).await.unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.completed_at, before.completed_at);
    }
    assert_eq!(h.balance("U1").await, Decimal::from(100));
}

// ============================================================================
// Sweeper
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_expire_once() {
    let h = TestHarness::with_sla(Duration::ZERO);
    let record = h
        .engine
        .create(top_up("U1", "K1", "100"))
        .await
        .unwrap()
        .record;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let sweeper = h.sweeper(false);
        handles.push(tokio::spawn(async move { sweeper.sweep_once().await.unwrap() }));
    }
    let mut expired = 0;
    for handle in handles {
        expired += handle.await.unwrap().expired;
    }
    assert_eq!(expired, 1);

    let stored = h.store.get(record.id).await.unwrap();
    assert_eq!(stored.state, LedgerState::Failed);
    assert!(stored.timed_out());
    assert!(stored.completed_at.is_some());
    assert_eq!(h.balance("U1").await, Decimal::ZERO);
}

#[tokio::test]
async fn test_sweep_reconciles_settled_record() {
    let h = TestHarness::with_sla(Duration::ZERO);
    let record = h
        .engine
        .create(top_up("U1", "K1", "640"))
        .await
        .unwrap()
        .record;
    h.gateway.settle(success(&record));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.sweeper(true).sweep_once().await.unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(h.gateway.query_count(), 1);

    let stored = h.store.get(record.id).await.unwrap();
    assert_eq!(stored.state, LedgerState::Completed);
    assert!(!stored.timed_out());
    assert_eq!(h.balance("U1").await, Decimal::from(640));
}

#[tokio::test]
async fn test_sweep_expires_when_gateway_still_processing() {
    let h = TestHarness::with_sla(Duration::ZERO);
    let record = h
        .engine
        .create(top_up("U1", "K1", "640"))
        .await
        .unwrap()
        .record;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.sweeper(true).sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert!(h.store.get(record.id).await.unwrap().timed_out());
}

#[tokio::test]
async fn test_sweep_expires_when_settled_amount_mismatches() {
    let h = TestHarness::with_sla(Duration::ZERO);
    let record = h
        .engine
        .create(top_up("U1", "K1", "640"))
        .await
        .unwrap()
        .record;
    let mut outcome = success(&record);
    outcome.settled_amount = Some(Decimal::ONE);
    h.gateway.settle(outcome);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.sweeper(true).sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.reconciled, 0);

    let stored = h.store.get(record.id).await.unwrap();
    assert_eq!(stored.state, LedgerState::Failed);
    assert!(stored.timed_out());
    assert_eq!(h.balance("U1").await, Decimal::ZERO);

    // Nothing left for later sweeps
    let again = h.sweeper(true).sweep_once().await.unwrap();
    assert_eq!(again.total(), 0);
}

#[tokio::test]
async fn test_sweep_recovers_stale_created_and_submitted() {
    let h = TestHarness::with_sla(Duration::from_secs(60));
    let long_ago = Utc::now() - chrono::Duration::hours(1);

    // Crash between insert and initiate
    let stranded = LedgerRecord::new(&top_up("U1", "K-created", "10"), long_ago);
    h.store.insert(stranded.clone()).await.unwrap();

    // Crash between accept and queued ack
    let mut accepted = LedgerRecord::new(&top_up("U1", "K-submitted", "10"), long_ago);
    RecordPatch::new()
        .external_reference("EXT-STALE")
        .apply(&mut accepted, LedgerState::Submitted, long_ago);
    h.store.insert(accepted.clone()).await.unwrap();

    let report = h.sweeper(false).sweep_once().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.acknowledged, 1);

    assert_eq!(
        h.store.get(stranded.id).await.unwrap().state,
        LedgerState::Failed
    );
    let pending = h.store.get(accepted.id).await.unwrap();
    assert_eq!(pending.state, LedgerState::Pending);
    assert!(pending.pending_deadline.is_some());
}

#[tokio::test]
async fn test_sweep_leaves_created_inside_abandon_window() {
    // Older than the SLA but another instance may still be retrying initiate
    let h = TestHarness::with_sla(Duration::from_secs(60));
    let five_minutes_ago = Utc::now() - chrono::Duration::minutes(5);

    let in_progress = LedgerRecord::new(&top_up("U1", "K-created", "10"), five_minutes_ago);
    h.store.insert(in_progress.clone()).await.unwrap();

    let mut accepted = LedgerRecord::new(&top_up("U1", "K-submitted", "10"), five_minutes_ago);
    RecordPatch::new()
        .external_reference("EXT-LOST-ACK")
        .apply(&mut accepted, LedgerState::Submitted, five_minutes_ago);
    h.store.insert(accepted.clone()).await.unwrap();

    let report = h.sweeper(false).sweep_once().await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(
        h.store.get(in_progress.id).await.unwrap().state,
        LedgerState::Created
    );
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_only_from_created() {
    let h = TestHarness::new();
    let owner = OwnerId::from("U1");

    let created = LedgerRecord::new(&top_up("U1", "K1", "10"), Utc::now());
    h.store.insert(created.clone()).await.unwrap();

    let err = h
        .engine
        .cancel(&OwnerId::from("U2"), created.id)
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 403);

    let cancelled = h.engine.cancel(&owner, created.id).await.unwrap();
    assert_eq!(cancelled.state, LedgerState::Failed);
    assert!(cancelled.completed_at.is_some());

    let pending = h
        .engine
        .create(top_up("U1", "K2", "10"))
        .await
        .unwrap()
        .record;
    let err = h.engine.cancel(&owner, pending.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn test_failed_key_can_be_reused() {
    let h = TestHarness::new();
    h.gateway
        .fail_next_initiate(crate::gateway::GatewayError::Rejected("limit".into()));
    let failed = h.engine.create(top_up("U1", "K1", "10")).await.unwrap();
    assert_eq!(failed.record.state, LedgerState::Failed);
    assert!(failed.gateway_error.is_some());

    let retry = h.engine.create(top_up("U1", "K1", "10")).await.unwrap();
    assert!(!retry.replayed);
    assert_ne!(retry.record.id, failed.record.id);
    assert_eq!(retry.record.state, LedgerState::Pending);
}

// ============================================================================
// Projection
// ============================================================================

#[tokio::test]
async fn test_rebuild_matches_incremental_balance() {
    let h = TestHarness::new();
    let owner = OwnerId::from("U1");

    let movements = [
        top_up("U1", "a", "1000"),
        bank_transfer("U1", "b", "250.25"),
        top_up("U1", "c", "99.99"),
        bank_transfer("U1", "d", "40"),
        top_up("U1", "e", "5"),
    ];
    for (i, req) in movements.into_iter().enumerate() {
        let record = h.engine.create(req).await.unwrap().record;
        // Leave the last one PENDING
        if i < 4 {
            h.engine.apply_callback(&success(&record)).await.unwrap();
        }
    }

    let incremental = h.engine.balance(&owner).await.unwrap();
    let completed = h.store.completed_for_owner(&owner).await.unwrap();
    let rebuilt = BalanceProjector::rebuild(&owner, &completed);
    assert_eq!(rebuilt.available_balance, incremental.available_balance);
    assert_eq!(rebuilt.version, incremental.version);
    assert_eq!(incremental.available_balance.to_string(), "809.74");

    // A cold projector over the same ledger agrees too
    h.engine.projector().invalidate(&owner);
    let cold = h.engine.balance(&owner).await.unwrap();
    assert_eq!(cold.available_balance, incremental.available_balance);
}

#[tokio::test]
async fn test_purchase_entitlements_and_stats() {
    let h = TestHarness::new();
    let owner = OwnerId::from("U1");

    let mut metadata = Map::new();
    metadata.insert("planId".into(), json!("data2"));
    let purchase = TransferRequest {
        owner_id: owner.clone(),
        idempotency_key: "plan-1".into(),
        kind: RecordKind::ServicePurchase,
        direction: Direction::Debit,
        amount: Amount::parse("250").unwrap(),
        destination: "0712345678".into(),
        metadata,
    };
    let record = h.engine.create(purchase).await.unwrap().record;
    h.engine.apply_callback(&success(&record)).await.unwrap();

    let ent = h.engine.entitlements(&owner).await.unwrap();
    assert_eq!(ent.data_mb, 1536);
    assert_eq!(ent.active.len(), 1);

    let stats = h
        .engine
        .stats(&owner, crate::ledger::projector::StatsPeriod::Today)
        .await
        .unwrap();
    assert_eq!(stats.total_debits, Decimal::from(250));
    assert_eq!(stats.count, 1);
}
