//! Simulated Gateway
//!
//! In-process stand-in for the payment processor. Used by the `simulated`
//! provider in development and by tests. Behaviour is scriptable:
//! - queue synchronous errors for the next `initiate` calls
//! - accept without the queued acknowledgement
//! - settle references so `query_status` reports them
//! - auto-settle after a delay through the callback queue

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::signature::CallbackVerifier;
use super::{
    CallbackAuth, CallbackOutcome, GatewayAcceptance, GatewayError, GatewayStatus, InitiateRequest, Outcome,
    PaymentGateway,
};
use crate::ledger::callback_queue::CallbackSender;
use crate::ledger::error::LedgerError;
use crate::ledger::types::RecordKind;

/// Wire shape of simulated callbacks
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedCallback {
    pub external_reference: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Default)]
struct Script {
    initiate_errors: VecDeque<GatewayError>,
    withhold_queued_ack: bool,
    settled: HashMap<String, CallbackOutcome>,
    issued: HashMap<String, InitiateRequest>,
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated payment gateway
pub struct SimulatedGateway {
    verifier: CallbackVerifier,
    script: Mutex<Script>,
    initiate_count: AtomicUsize,
    query_count: AtomicUsize,
    auto_settle: Option<(Duration, CallbackSender)>,
}

impl SimulatedGateway {
    pub fn new(verifier: CallbackVerifier) -> Self {
        Self {
            verifier,
            script: Mutex::new(Script::default()),
            initiate_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            auto_settle: None,
        }
    }

    /// Deliver a success callback for every accepted request after `delay`.
    pub fn with_auto_settle(mut self, delay: Duration, callbacks: CallbackSender) -> Self {
        self.auto_settle = Some((delay, callbacks));
        self
    }

    /// Fail the next `initiate` call with `error`. Calls queue up in order.
    pub fn fail_next_initiate(&self, error: GatewayError) {
        lock(&self.script).initiate_errors.push_back(error);
    }

    /// Accept without acknowledging the request as queued.
    pub fn set_withhold_queued_ack(&self, withhold: bool) {
        lock(&self.script).withhold_queued_ack = withhold;
    }

    /// Record a final outcome that `query_status` will report.
    pub fn settle(&self, outcome: CallbackOutcome) {
        lock(&self.script)
            .settled
            .insert(outcome.external_reference.clone(), outcome);
    }

    pub fn initiate_count(&self) -> usize {
        self.initiate_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Request that produced `external_reference`, if any.
    pub fn issued(&self, external_reference: &str) -> Option<InitiateRequest> {
        lock(&self.script).issued.get(external_reference).cloned()
    }

    /// Signed webhook body for `outcome`, as the processor would post it.
    pub fn callback_body(&self, outcome: &CallbackOutcome) -> Result<(Vec<u8>, String), LedgerError> {
        let wire = SimulatedCallback {
            external_reference: outcome.external_reference.clone(),
            outcome: match outcome.outcome {
                Outcome::Success => "success".to_string(),
                Outcome::Failure => "failure".to_string(),
            },
            settled_amount: outcome.settled_amount,
            receipt: outcome.receipt.clone(),
            description: outcome.description.clone(),
        };
        let body = serde_json::to_vec(&wire)
            .map_err(|e| LedgerError::MalformedCallback(e.to_string()))?;
        let signature = self.verifier.sign(&body)?;
        Ok((body, signature))
    }

    fn success_for(req: &InitiateRequest, external_reference: &str) -> CallbackOutcome {
        CallbackOutcome {
            external_reference: external_reference.to_string(),
            outcome: Outcome::Success,
            settled_amount: Some(req.amount.value()),
            receipt: Some(format!("SIMRCPT{}", &req.record_id.to_string()[16..])),
            description: Some("The service request is processed successfully.".to_string()),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<GatewayAcceptance, GatewayError> {
        self.initiate_count.fetch_add(1, Ordering::SeqCst);

        let external_reference = format!("SIM-{}", req.record_id);
        let queued = {
            let mut script = lock(&self.script);
            if let Some(error) = script.initiate_errors.pop_front() {
                debug!(record_id = %req.record_id, error = %error, "Simulated initiate failure");
                return Err(error);
            }
            script
                .issued
                .insert(external_reference.clone(), req.clone());
            !script.withhold_queued_ack
        };

        info!(
            record_id = %req.record_id,
            external_reference = %external_reference,
            kind = %req.kind,
            amount = %req.amount,
            "Simulated gateway accepted request"
        );

        if let Some((delay, callbacks)) = &self.auto_settle {
            let outcome = Self::success_for(req, &external_reference);
            self.settle(outcome.clone());
            let callbacks = callbacks.clone();
            let delay = *delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = callbacks.enqueue(outcome).await {
                    warn!(error = %e, "Simulated auto-settle callback dropped");
                }
            });
        }

        Ok(GatewayAcceptance {
            external_reference,
            queued,
        })
    }

    fn parse_callback(
        &self,
        auth: CallbackAuth<'_>,
        raw: &[u8],
    ) -> Result<CallbackOutcome, LedgerError> {
        self.verifier.verify(auth.signature, raw)?;

        let wire: SimulatedCallback = serde_json::from_slice(raw)
            .map_err(|e| LedgerError::MalformedCallback(format!("invalid body: {}", e)))?;

        if wire.external_reference.trim().is_empty() {
            return Err(LedgerError::MalformedCallback(
                "externalReference is empty".into(),
            ));
        }

        let outcome = match wire.outcome.to_ascii_lowercase().as_str() {
            "success" | "completed" => Outcome::Success,
            "failure" | "failed" => Outcome::Failure,
            other => {
                return Err(LedgerError::MalformedCallback(format!(
                    "unknown outcome '{}'",
                    other
                )));
            }
        };

        Ok(CallbackOutcome {
            external_reference: wire.external_reference,
            outcome,
            settled_amount: wire.settled_amount,
            receipt: wire.receipt,
            description: wire.description,
        })
    }

    async fn query_status(
        &self,
        _kind: RecordKind,
        external_reference: &str,
    ) -> Result<GatewayStatus, GatewayError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);

        let script = lock(&self.script);
        if let Some(outcome) = script.settled.get(external_reference) {
            return Ok(GatewayStatus::Settled(outcome.clone()));
        }
        if script.issued.contains_key(external_reference) {
            return Ok(GatewayStatus::InProgress);
        }
        Ok(GatewayStatus::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{Direction, LedgerRecordId};
    use crate::money::Amount;

    fn request() -> InitiateRequest {
        InitiateRequest {
            record_id: LedgerRecordId::new(),
            kind: RecordKind::MobileMoneyPush,
            direction: Direction::Credit,
            amount: Amount::parse("100").unwrap(),
            destination: "254712345678".to_string(),
            reference: "TOPUP".to_string(),
            description: "Wallet top-up".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initiate_issues_reference() {
        let gw = SimulatedGateway::new(CallbackVerifier::new("k"));
        let req = request();
        let acc = gw.initiate(&req).await.unwrap();
        assert_eq!(acc.external_reference, format!("SIM-{}", req.record_id));
        assert!(acc.queued);
        assert_eq!(gw.initiate_count(), 1);
        assert_eq!(
            gw.query_status(req.kind, &acc.external_reference)
                .await
                .unwrap(),
            GatewayStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let gw = SimulatedGateway::new(CallbackVerifier::new("k"));
        gw.fail_next_initiate(GatewayError::Timeout);
        gw.fail_next_initiate(GatewayError::Rejected("limit".into()));

        assert_eq!(
            gw.initiate(&request()).await.unwrap_err(),
            GatewayError::Timeout
        );
        assert!(matches!(
            gw.initiate(&request()).await.unwrap_err(),
            GatewayError::Rejected(_)
        ));
        assert!(gw.initiate(&request()).await.is_ok());
    }

    #[test]
    fn test_callback_roundtrip_through_signature() {
        let gw = SimulatedGateway::new(CallbackVerifier::new("k"));
        let outcome = CallbackOutcome {
            external_reference: "SIM-1".into(),
            outcome: Outcome::Failure,
            settled_amount: None,
            receipt: None,
            description: Some("Request cancelled by user".into()),
        };
        let (body, sig) = gw.callback_body(&outcome).unwrap();
        assert_eq!(gw.parse_callback(CallbackAuth::signed(&sig), &body).unwrap(), outcome);
        assert!(gw.parse_callback(CallbackAuth::default(), &body).is_err());

        // The URL token is Daraja's credential, not ours
        let token = CallbackVerifier::new("k").url_token().unwrap();
        assert!(gw.parse_callback(CallbackAuth::with_token(&token), &body).is_err());
    }

    #[test]
    fn test_rejects_unknown_outcome() {
        let verifier = CallbackVerifier::new("k");
        let gw = SimulatedGateway::new(verifier.clone());
        let body = br#"{"externalReference":"SIM-1","outcome":"maybe"}"#;
        let sig = verifier.sign(body).unwrap();
        assert!(matches!(
            gw.parse_callback(CallbackAuth::signed(&sig), body),
            Err(LedgerError::MalformedCallback(_))
        ));
    }
}
