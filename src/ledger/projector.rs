//! Balance Projector
//!
//! Derived, rebuildable read-model over COMPLETED records. The cache is only
//! advanced by [`BalanceProjector::apply_effect`], which the engine calls from
//! the winning COMPLETED transition. Every projection remembers the record ids
//! it has applied, so a repeated call for the same record is a no-op.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};
use utoipa::ToSchema;

use super::error::LedgerError;
use super::state::LedgerState;
use super::store::LedgerStore;
use super::types::{Direction, LedgerRecord, LedgerRecordId, OwnerId, RecordKind};
use crate::catalog::{PlanCatalog, PlanCategory};

/// Point-in-time balance of one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    #[schema(value_type = String)]
    pub owner_id: OwnerId,
    #[schema(value_type = String, example = "1250.00")]
    pub available_balance: Decimal,
    /// Number of COMPLETED records folded into the balance
    pub version: u64,
    pub as_of: DateTime<Utc>,
}

/// Signed balance effect of a COMPLETED record
pub fn effect(record: &LedgerRecord) -> Decimal {
    match record.direction {
        Direction::Credit => record.amount.value(),
        Direction::Debit => -record.amount.value(),
    }
}

#[derive(Debug, Clone)]
struct Projection {
    balance: Decimal,
    applied: HashSet<LedgerRecordId>,
    as_of: DateTime<Utc>,
}

impl Projection {
    fn from_records(records: &[LedgerRecord], now: DateTime<Utc>) -> Self {
        let mut projection = Projection {
            balance: Decimal::ZERO,
            applied: HashSet::new(),
            as_of: now,
        };
        for record in records.iter().filter(|r| r.state == LedgerState::Completed) {
            projection.fold(record);
        }
        projection
    }

    /// Returns false when the record was already folded in.
    fn fold(&mut self, record: &LedgerRecord) -> bool {
        if !self.applied.insert(record.id) {
            return false;
        }
        self.balance += effect(record);
        if let Some(completed_at) = record.completed_at {
            self.as_of = self.as_of.max(completed_at);
        }
        true
    }

    fn snapshot(&self, owner: &OwnerId) -> BalanceSnapshot {
        let mut balance = self.balance;
        balance.rescale(crate::money::KES_DECIMALS);
        BalanceSnapshot {
            owner_id: owner.clone(),
            available_balance: balance,
            version: self.applied.len() as u64,
            as_of: self.as_of,
        }
    }
}

pub struct BalanceProjector {
    store: Arc<dyn LedgerStore>,
    cache: DashMap<OwnerId, Projection>,
}

impl BalanceProjector {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Rebuild a balance from COMPLETED records alone; other states are ignored.
    pub fn rebuild(owner: &OwnerId, records: &[LedgerRecord]) -> BalanceSnapshot {
        let as_of = records
            .iter()
            .filter_map(|r| r.completed_at)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Projection::from_records(records, as_of).snapshot(owner)
    }

    async fn ensure_loaded(&self, owner: &OwnerId) -> Result<(), LedgerError> {
        if self.cache.contains_key(owner) {
            return Ok(());
        }
        let records = self.store.completed_for_owner(owner).await?;
        let projection = Projection::from_records(&records, Utc::now());
        debug!(
            owner_id = %owner,
            records = records.len(),
            "Balance projection loaded from ledger"
        );
        // A concurrent loader may have won; both read the same store.
        self.cache.entry(owner.clone()).or_insert(projection);
        Ok(())
    }

    /// Fold a COMPLETED record into its owner's balance.
    pub async fn apply_effect(&self, record: &LedgerRecord) -> Result<BalanceSnapshot, LedgerError> {
        if record.state != LedgerState::Completed {
            return Err(LedgerError::Validation(format!(
                "record {} is {}, only COMPLETED records carry a balance effect",
                record.id, record.state
            )));
        }

        self.ensure_loaded(&record.owner_id).await?;

        let mut projection = self
            .cache
            .get_mut(&record.owner_id)
            .ok_or_else(|| LedgerError::Storage("balance projection evicted".into()))?;
        if projection.fold(record) {
            info!(
                owner_id = %record.owner_id,
                record_id = %record.id,
                direction = %record.direction,
                amount = %record.amount,
                balance = %projection.balance,
                "Balance effect applied"
            );
        } else {
            debug!(record_id = %record.id, "Balance effect already applied");
        }
        Ok(projection.snapshot(&record.owner_id))
    }

    pub async fn current_balance(&self, owner: &OwnerId) -> Result<BalanceSnapshot, LedgerError> {
        self.ensure_loaded(owner).await?;
        self.cache
            .get(owner)
            .map(|p| p.snapshot(owner))
            .ok_or_else(|| LedgerError::Storage("balance projection evicted".into()))
    }

    /// Drop the cached projection; the next read rebuilds from the ledger.
    pub fn invalidate(&self, owner: &OwnerId) {
        self.cache.remove(owner);
    }

    /// Active service entitlements from completed plan purchases.
    pub async fn entitlements(
        &self,
        owner: &OwnerId,
        catalog: &PlanCatalog,
        now: DateTime<Utc>,
    ) -> Result<Entitlements, LedgerError> {
        let records = self.store.completed_for_owner(owner).await?;
        Ok(Entitlements::derive(&records, catalog, now))
    }

    /// Completed-movement totals for `period` ending at `now`.
    pub async fn stats(
        &self,
        owner: &OwnerId,
        period: StatsPeriod,
        now: DateTime<Utc>,
    ) -> Result<TransferStats, LedgerError> {
        let records = self.store.completed_for_owner(owner).await?;
        Ok(TransferStats::summarize(&records, period, now))
    }
}

// ============================================================================
// Entitlements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub plan_id: String,
    pub name: String,
    pub category: PlanCategory,
    pub quantity: u64,
    /// `None` for plans that never expire
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub data_mb: u64,
    pub sms: u64,
    pub bonga_points: u64,
    pub active: Vec<Entitlement>,
}

impl Entitlements {
    pub fn derive(records: &[LedgerRecord], catalog: &PlanCatalog, now: DateTime<Utc>) -> Self {
        let mut out = Entitlements::default();

        for record in records {
            if record.state != LedgerState::Completed || record.kind != RecordKind::ServicePurchase {
                continue;
            }
            let (Some(plan), Some(completed_at)) = (
                record.metadata_str("planId").and_then(|id| catalog.get(id)),
                record.completed_at,
            ) else {
                continue;
            };

            let expires_at = plan
                .validity_days
                .map(|days| completed_at + Duration::days(i64::from(days)));
            if expires_at.is_some_and(|at| at <= now) {
                continue;
            }

            match plan.category {
                PlanCategory::Data => out.data_mb += plan.quantity,
                PlanCategory::Sms => out.sms += plan.quantity,
                PlanCategory::Bonga => out.bonga_points += plan.quantity,
            }
            out.active.push(Entitlement {
                plan_id: plan.id.to_string(),
                name: plan.name.to_string(),
                category: plan.category,
                quantity: plan.quantity,
                expires_at,
            });
        }
        out
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatsPeriod {
    Today,
    Week,
    Month,
    Year,
}

impl StatsPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsPeriod::Today => "today",
            StatsPeriod::Week => "week",
            StatsPeriod::Month => "month",
            StatsPeriod::Year => "year",
        }
    }

    /// Start of the window ending at `now`. `Today` starts at UTC midnight.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            StatsPeriod::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now),
            StatsPeriod::Week => now - Duration::days(7),
            StatsPeriod::Month => now - Duration::days(30),
            StatsPeriod::Year => now - Duration::days(365),
        }
    }
}

impl fmt::Display for StatsPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsPeriod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "today" => Ok(StatsPeriod::Today),
            "week" => Ok(StatsPeriod::Week),
            "month" => Ok(StatsPeriod::Month),
            "year" => Ok(StatsPeriod::Year),
            other => Err(LedgerError::Validation(format!(
                "period must be today, week, month or year, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KindTotal {
    #[schema(value_type = String)]
    pub kind: RecordKind,
    #[schema(value_type = String)]
    pub total: Decimal,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub period: StatsPeriod,
    pub since: DateTime<Utc>,
    #[schema(value_type = String)]
    pub total_credits: Decimal,
    #[schema(value_type = String)]
    pub total_debits: Decimal,
    #[schema(value_type = String)]
    pub net: Decimal,
    pub count: u64,
    pub by_kind: Vec<KindTotal>,
}

impl TransferStats {
    pub fn summarize(records: &[LedgerRecord], period: StatsPeriod, now: DateTime<Utc>) -> Self {
        let since = period.start(now);
        let mut credits = Decimal::ZERO;
        let mut debits = Decimal::ZERO;
        let mut count = 0u64;
        let mut by_kind: BTreeMap<i16, (RecordKind, Decimal, u64)> = BTreeMap::new();

        for record in records {
            if record.state != LedgerState::Completed {
                continue;
            }
            if !record.completed_at.is_some_and(|at| at >= since && at <= now) {
                continue;
            }
            let amount = record.amount.value();
            match record.direction {
                Direction::Credit => credits += amount,
                Direction::Debit => debits += amount,
            }
            count += 1;
            let entry = by_kind
                .entry(record.kind.id())
                .or_insert((record.kind, Decimal::ZERO, 0));
            entry.1 += amount;
            entry.2 += 1;
        }

        TransferStats {
            period,
            since,
            total_credits: credits,
            total_debits: debits,
            net: credits - debits,
            count,
            by_kind: by_kind
                .into_values()
                .map(|(kind, total, count)| KindTotal { kind, total, count })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::MemoryLedgerStore;
    use crate::ledger::types::{RecordPatch, TransferRequest};
    use crate::money::Amount;
    use serde_json::{Map, Value};

    fn completed(
        kind: RecordKind,
        direction: Direction,
        amount: &str,
        completed_at: DateTime<Utc>,
        metadata: Map<String, Value>,
    ) -> LedgerRecord {
        let req = TransferRequest {
            owner_id: OwnerId::from("U1"),
            idempotency_key: ulid::Ulid::new().to_string(),
            kind,
            direction,
            amount: Amount::parse(amount).unwrap(),
            destination: "254712345678".into(),
            metadata,
        };
        let mut record = LedgerRecord::new(&req, completed_at);
        RecordPatch::new().apply(&mut record, LedgerState::Completed, completed_at);
        record
    }

    fn plan(id: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("planId".into(), Value::String(id.into()));
        m
    }

    #[test]
    fn test_rebuild_sums_completed_only() {
        let now = Utc::now();
        let credit = completed(
            RecordKind::MobileMoneyPush,
            Direction::Credit,
            "1000",
            now,
            Map::new(),
        );
        let debit = completed(
            RecordKind::BankTransfer,
            Direction::Debit,
            "250.50",
            now,
            Map::new(),
        );
        let mut failed = debit.clone();
        failed.id = LedgerRecordId::new();
        failed.state = LedgerState::Failed;

        let snapshot = BalanceProjector::rebuild(&OwnerId::from("U1"), &[credit, debit, failed]);
        assert_eq!(snapshot.available_balance.to_string(), "749.50");
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_apply_effect_is_idempotent_per_record() {
        let store = Arc::new(MemoryLedgerStore::new());
        let projector = BalanceProjector::new(store);
        let record = completed(
            RecordKind::MobileMoneyPush,
            Direction::Credit,
            "300",
            Utc::now(),
            Map::new(),
        );

        let first = projector.apply_effect(&record).await.unwrap();
        let second = projector.apply_effect(&record).await.unwrap();
        assert_eq!(first.available_balance, Decimal::from(300));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_apply_effect_rejects_non_completed() {
        let projector = BalanceProjector::new(Arc::new(MemoryLedgerStore::new()));
        let mut record = completed(
            RecordKind::BankTransfer,
            Direction::Debit,
            "10",
            Utc::now(),
            Map::new(),
        );
        record.state = LedgerState::Pending;
        assert!(projector.apply_effect(&record).await.is_err());
    }

    #[test]
    fn test_entitlements_respect_validity() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let records = vec![
            // Daily plan bought two days ago has expired
            completed(
                RecordKind::ServicePurchase,
                Direction::Debit,
                "50",
                now - Duration::days(2),
                plan("data1"),
            ),
            completed(
                RecordKind::ServicePurchase,
                Direction::Debit,
                "250",
                now - Duration::days(2),
                plan("data2"),
            ),
            completed(
                RecordKind::ServicePurchase,
                Direction::Debit,
                "30",
                now,
                plan("sms1"),
            ),
            // Bonga points never expire
            completed(
                RecordKind::ServicePurchase,
                Direction::Debit,
                "100",
                now - Duration::days(400),
                plan("bonga1"),
            ),
        ];

        let ent = Entitlements::derive(&records, &catalog, now);
        assert_eq!(ent.data_mb, 1536);
        assert_eq!(ent.sms, 50);
        assert_eq!(ent.bonga_points, 100);
        assert_eq!(ent.active.len(), 3);
    }

    #[test]
    fn test_stats_window() {
        let now = Utc::now();
        let records = vec![
            completed(
                RecordKind::MobileMoneyPush,
                Direction::Credit,
                "1000",
                now - Duration::days(1),
                Map::new(),
            ),
            completed(
                RecordKind::BankTransfer,
                Direction::Debit,
                "400",
                now - Duration::days(3),
                Map::new(),
            ),
            completed(
                RecordKind::BankTransfer,
                Direction::Debit,
                "100",
                now - Duration::days(20),
                Map::new(),
            ),
        ];

        let week = TransferStats::summarize(&records, StatsPeriod::Week, now);
        assert_eq!(week.total_credits, Decimal::from(1000));
        assert_eq!(week.total_debits, Decimal::from(400));
        assert_eq!(week.net, Decimal::from(600));
        assert_eq!(week.count, 2);
        assert_eq!(week.by_kind.len(), 2);

        let month = TransferStats::summarize(&records, StatsPeriod::Month, now);
        assert_eq!(month.total_debits, Decimal::from(500));
    }

    #[test]
    fn test_period_parse() {
        assert_eq!("Week".parse::<StatsPeriod>().unwrap(), StatsPeriod::Week);
        assert!("decade".parse::<StatsPeriod>().is_err());
    }
}
