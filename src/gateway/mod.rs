//! Payment Gateway Adapters
//!
//! The ledger talks to the outside payment processor only through
//! [`PaymentGateway`]. Implementations:
//! - [`daraja::DarajaGateway`]: Safaricom Daraja (STK push, B2C)
//! - [`simulated::SimulatedGateway`]: in-process, for development and tests
//!
//! Callbacks are authenticated with [`signature::CallbackVerifier`] before
//! any payload is parsed: by body signature where the provider can sign, by
//! the token in the registered callback URL where it cannot.

pub mod daraja;
pub mod signature;
pub mod simulated;

pub use daraja::DarajaGateway;
pub use signature::CallbackVerifier;
pub use simulated::SimulatedGateway;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::ledger::error::LedgerError;
use crate::ledger::types::{Direction, LedgerRecordId, RecordKind};
use crate::money::Amount;

/// Synchronous gateway failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Gateway answered and refused the request; nothing was moved
    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    /// Request never reached the gateway; safe to send again
    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    /// Request may have been delivered and its answer lost
    #[error("Gateway timed out")]
    Timeout,

    /// Transport or upstream failure after the request was sent
    #[error("Gateway outcome unknown: {0}")]
    Indeterminate(String),

    /// Operation not offered for this kind of record
    #[error("Unsupported by gateway: {0}")]
    Unsupported(String),
}

impl GatewayError {
    /// Only failures where the gateway never saw the request.
    ///
    /// A timed-out push may already be on the customer's phone, so sending
    /// it again could move money twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unreachable(_))
    }

    /// Failures caused by the gateway or the network rather than the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Unreachable(_) | GatewayError::Timeout | GatewayError::Indeterminate(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_connect() {
            GatewayError::Unreachable(e.to_string())
        } else if e.is_builder() {
            GatewayError::Rejected(e.to_string())
        } else {
            GatewayError::Indeterminate(e.to_string())
        }
    }
}

/// Everything the gateway needs to start a money movement
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub record_id: LedgerRecordId,
    pub kind: RecordKind,
    pub direction: Direction,
    pub amount: Amount,
    pub destination: String,
    /// Short human-readable reference shown to the payer
    pub reference: String,
    pub description: String,
}

/// Gateway accepted the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAcceptance {
    pub external_reference: String,
    /// Gateway also acknowledged it as queued (SUBMITTED → PENDING immediately)
    pub queued: bool,
}

/// Settlement outcome reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Normalised, authenticated callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub external_reference: String,
    pub outcome: Outcome,
    pub settled_amount: Option<Decimal>,
    /// Gateway receipt number, e.g. M-Pesa `MpesaReceiptNumber`
    pub receipt: Option<String>,
    pub description: Option<String>,
}

/// Credentials presented with a webhook delivery
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackAuth<'a> {
    /// `X-Callback-Signature` header
    pub signature: Option<&'a str>,
    /// `token` query parameter of the callback URL
    pub url_token: Option<&'a str>,
}

impl<'a> CallbackAuth<'a> {
    pub fn signed(signature: &'a str) -> Self {
        Self {
            signature: Some(signature),
            url_token: None,
        }
    }

    pub fn with_token(token: &'a str) -> Self {
        Self {
            signature: None,
            url_token: Some(token),
        }
    }
}

/// Result of polling the gateway for a record's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Settled(CallbackOutcome),
    InProgress,
    Unknown,
}

/// External payment processor
///
/// `initiate` is called at most once per successful CREATED → SUBMITTED
/// transition; callers only retry it for errors where `is_retryable()` holds.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initiate(&self, req: &InitiateRequest) -> Result<GatewayAcceptance, GatewayError>;

    /// Authenticate and normalise a raw webhook body.
    ///
    /// Fails closed with `MalformedCallback` when the credential this
    /// gateway expects is missing or wrong.
    fn parse_callback(
        &self,
        auth: CallbackAuth<'_>,
        raw: &[u8],
    ) -> Result<CallbackOutcome, LedgerError>;

    /// Ask the gateway for the status of a previously accepted request.
    async fn query_status(
        &self,
        kind: RecordKind,
        external_reference: &str,
    ) -> Result<GatewayStatus, GatewayError>;
}
