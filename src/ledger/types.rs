//! Ledger Core Types
//!
//! Records, identifiers and the mutation patch applied by state transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::state::LedgerState;
use crate::money::Amount;

/// Ledger record ID - ULID-based, sortable by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerRecordId(ulid::Ulid);

impl LedgerRecordId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for LedgerRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LedgerRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LedgerRecordId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for LedgerRecordId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

/// Subject claim of the caller that owns a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(alias = "service_purchase")]
    ServicePurchase,
    #[serde(alias = "bank_transfer")]
    BankTransfer,
    #[serde(alias = "mobile_money_push")]
    MobileMoneyPush,
}

impl RecordKind {
    #[inline]
    pub fn id(&self) -> i16 {
        match self {
            RecordKind::ServicePurchase => 1,
            RecordKind::BankTransfer => 2,
            RecordKind::MobileMoneyPush => 3,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(RecordKind::ServicePurchase),
            2 => Some(RecordKind::BankTransfer),
            3 => Some(RecordKind::MobileMoneyPush),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::ServicePurchase => "ServicePurchase",
            RecordKind::BankTransfer => "BankTransfer",
            RecordKind::MobileMoneyPush => "MobileMoneyPush",
        }
    }

    /// Direction used when the request does not name one.
    ///
    /// Purchases and bank transfers take money out of the owner's balance;
    /// a push payment tops it up.
    pub fn default_direction(&self) -> Direction {
        match self {
            RecordKind::ServicePurchase | RecordKind::BankTransfer => Direction::Debit,
            RecordKind::MobileMoneyPush => Direction::Credit,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect direction relative to the owner's primary balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    #[inline]
    pub fn id(&self) -> i16 {
        match self {
            Direction::Credit => 1,
            Direction::Debit => -1,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Direction::Credit),
            -1 => Some(Direction::Debit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated request to move money
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub owner_id: OwnerId,
    pub idempotency_key: String,
    pub kind: RecordKind,
    pub direction: Direction,
    pub amount: Amount,
    pub destination: String,
    pub metadata: Map<String, Value>,
}

impl TransferRequest {
    /// SHA-256 over the canonical JSON of everything that defines the
    /// movement. The idempotency key itself is excluded.
    pub fn fingerprint(&self) -> String {
        let body = serde_json::json!({
            "kind": self.kind.as_str(),
            "direction": self.direction.as_str(),
            "amount": self.amount.to_string(),
            "destination": self.destination,
            "metadata": Value::Object(self.metadata.clone()),
        });
        let mut canonical = String::new();
        write_canonical(&body, &mut canonical);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Serialise with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Durable ledger record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub id: LedgerRecordId,
    pub owner_id: OwnerId,
    pub kind: RecordKind,
    pub direction: Direction,
    pub amount: Amount,
    pub destination: String,
    pub external_reference: Option<String>,
    pub idempotency_key: String,
    #[serde(skip)]
    pub request_fingerprint: String,
    pub state: LedgerState,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
    pub pending_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    /// Build a fresh record in CREATED state.
    pub fn new(req: &TransferRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: LedgerRecordId::new(),
            owner_id: req.owner_id.clone(),
            kind: req.kind,
            direction: req.direction,
            amount: req.amount,
            destination: req.destination.clone(),
            external_reference: None,
            idempotency_key: req.idempotency_key.clone(),
            request_fingerprint: req.fingerprint(),
            state: LedgerState::Created,
            metadata: req.metadata.clone(),
            error: None,
            pending_deadline: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn timed_out(&self) -> bool {
        self.metadata
            .get("timedOut")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Mutation applied together with a state change
///
/// Only `compare_and_swap_state` applies a patch, so every field change on a
/// record is tied to exactly one transition.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub external_reference: Option<String>,
    pub metadata: Vec<(String, Value)>,
    pub error: Option<String>,
    pub pending_deadline: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference = Some(reference.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn pending_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.pending_deadline = Some(deadline);
        self
    }

    /// Apply this patch and the new state to `record`.
    ///
    /// `external_reference` is write-once. `completed_at` is set exactly when
    /// the new state is terminal.
    pub fn apply(&self, record: &mut LedgerRecord, new_state: LedgerState, now: DateTime<Utc>) {
        if record.external_reference.is_none() {
            record.external_reference = self.external_reference.clone();
        }
        for (key, value) in &self.metadata {
            record.metadata.insert(key.clone(), value.clone());
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
        if let Some(deadline) = self.pending_deadline {
            record.pending_deadline = Some(deadline);
        }

        record.state = new_state;
        record.updated_at = now;
        if new_state.is_terminal() {
            record.completed_at = Some(now);
            record.pending_deadline = None;
        } else {
            record.completed_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: &str, metadata: Value) -> TransferRequest {
        TransferRequest {
            owner_id: OwnerId::from("U1"),
            idempotency_key: "K1".to_string(),
            kind: RecordKind::BankTransfer,
            direction: Direction::Debit,
            amount: Amount::parse(amount).unwrap(),
            destination: "ACC-001".to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_record_id_parse() {
        let id = LedgerRecordId::new();
        let parsed: LedgerRecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<LedgerRecordId>().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = request("500", serde_json::json!({"bank": "KCB", "account": "123"}));
        let b = request("500.00", serde_json::json!({"account": "123", "bank": "KCB"}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_idempotency_key() {
        let a = request("500", serde_json::json!({}));
        let mut b = a.clone();
        b.idempotency_key = "K2".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_detects_payload_change() {
        let a = request("500", serde_json::json!({}));
        let b = request("501", serde_json::json!({}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_kind_serde_accepts_both_spellings() {
        let a: RecordKind = serde_json::from_str(r#""BankTransfer""#).unwrap();
        let b: RecordKind = serde_json::from_str(r#""bank_transfer""#).unwrap();
        assert_eq!(a, b);
        assert_eq!(RecordKind::from_id(a.id()), Some(a));
    }

    #[test]
    fn test_patch_sets_completed_at_only_for_terminal() {
        let now = Utc::now();
        let mut record = LedgerRecord::new(&request("10", serde_json::json!({})), now);

        RecordPatch::new()
            .external_reference("EXT-1")
            .apply(&mut record, LedgerState::Submitted, now);
        assert_eq!(record.external_reference.as_deref(), Some("EXT-1"));
        assert!(record.completed_at.is_none());

        RecordPatch::new()
            .external_reference("EXT-OTHER")
            .metadata("timedOut", true)
            .apply(&mut record, LedgerState::Failed, now);
        assert_eq!(record.external_reference.as_deref(), Some("EXT-1"));
        assert!(record.timed_out());
        assert_eq!(record.completed_at, Some(now));
    }
}
