//! Safaricom Daraja adapter
//!
//! - STK push (`CustomerPayBillOnline`) for `MobileMoneyPush` and `ServicePurchase`
//! - B2C `BusinessPayment` for `BankTransfer` payouts
//! - STK push status query for reconciliation
//!
//! Daraja only moves whole shillings; amounts with cents are rejected
//! before any request is sent.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::signature::CallbackVerifier;
use super::{
    CallbackAuth, CallbackOutcome, GatewayAcceptance, GatewayError, GatewayStatus, InitiateRequest, Outcome,
    PaymentGateway,
};
use crate::config::DarajaConfig;
use crate::ledger::error::LedgerError;
use crate::ledger::types::RecordKind;
use crate::msisdn::normalize_msisdn;

/// STK query error code meaning "still being processed"
const STK_QUERY_IN_PROGRESS: &str = "500.001.1001";

/// Refresh the OAuth token this long before Daraja expires it
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const ACCOUNT_REFERENCE_MAX: usize = 12;
const TRANSACTION_DESC_MAX: usize = 13;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds, sent as a string
    expires_in: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Daraja payment gateway
pub struct DarajaGateway {
    http: reqwest::Client,
    config: DarajaConfig,
    verifier: CallbackVerifier,
    callback_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl DarajaGateway {
    pub fn new(config: DarajaConfig, verifier: CallbackVerifier) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Unreachable(format!("http client: {}", e)))?;
        // Daraja cannot sign its callbacks, so the URL carries the credential
        let url_token = verifier
            .url_token()
            .map_err(|e| GatewayError::Unsupported(e.to_string()))?;
        let callback_url = format!(
            "{}/gateway/callback?token={}",
            config.callback_base_url.trim_end_matches('/'),
            url_token
        );
        Ok(Self {
            http,
            config,
            verifier,
            callback_url,
            token: Mutex::new(None),
        })
    }

    /// URL registered with Daraja for STK and B2C results.
    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &body));
        }
        let token: TokenResponse = response.json().await?;

        let ttl = token.expires_in.trim().parse::<u64>().unwrap_or(3599);
        let lifetime = Duration::from_secs(ttl).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(ttl_secs = ttl, "Daraja access token refreshed");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(http_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Rejected(format!("unreadable response: {}", e)))
    }

    fn stk_credentials(&self) -> (String, String) {
        let timestamp = daraja_timestamp(Utc::now());
        let password = stk_password(
            &self.config.business_short_code,
            &self.config.passkey,
            &timestamp,
        );
        (password, timestamp)
    }

    async fn stk_push(
        &self,
        req: &InitiateRequest,
        amount: u64,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let phone = normalize_msisdn(&req.destination)
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let (password, timestamp) = self.stk_credentials();

        let body = json!({
            "BusinessShortCode": self.config.business_short_code,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.business_short_code,
            "PhoneNumber": phone,
            "CallBackURL": self.callback_url(),
            "AccountReference": truncate(&req.reference, ACCOUNT_REFERENCE_MAX),
            "TransactionDesc": truncate(&req.description, TRANSACTION_DESC_MAX),
        });

        let response = self.post("/mpesa/stkpush/v1/processrequest", &body).await?;
        accepted(&response, "CheckoutRequestID")
    }

    async fn b2c_payment(
        &self,
        req: &InitiateRequest,
        amount: u64,
    ) -> Result<GatewayAcceptance, GatewayError> {
        let phone = normalize_msisdn(&req.destination)
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;

        let body = json!({
            "InitiatorName": self.config.initiator_name,
            "SecurityCredential": self.config.security_credential,
            "CommandID": "BusinessPayment",
            "Amount": amount,
            "PartyA": self.config.business_short_code,
            "PartyB": phone,
            "Remarks": req.description,
            "QueueTimeOutURL": self.callback_url(),
            "ResultURL": self.callback_url(),
            "Occasion": req.reference,
        });

        let response = self.post("/mpesa/b2c/v1/paymentrequest", &body).await?;
        accepted(&response, "ConversationID")
    }
}

#[async_trait]
impl PaymentGateway for DarajaGateway {
    fn name(&self) -> &'static str {
        "daraja"
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<GatewayAcceptance, GatewayError> {
        if !req.amount.is_whole() {
            return Err(GatewayError::Rejected(format!(
                "Daraja accepts whole shillings only, got {}",
                req.amount
            )));
        }
        let amount = req
            .amount
            .value()
            .to_u64()
            .ok_or_else(|| GatewayError::Rejected(format!("amount out of range: {}", req.amount)))?;

        let acceptance = match req.kind {
            RecordKind::MobileMoneyPush | RecordKind::ServicePurchase => {
                self.stk_push(req, amount).await?
            }
            RecordKind::BankTransfer => self.b2c_payment(req, amount).await?,
        };

        info!(
            record_id = %req.record_id,
            external_reference = %acceptance.external_reference,
            kind = %req.kind,
            "Daraja accepted request"
        );
        Ok(acceptance)
    }

    fn parse_callback(
        &self,
        auth: CallbackAuth<'_>,
        raw: &[u8],
    ) -> Result<CallbackOutcome, LedgerError> {
        self.verifier.verify_url_token(auth.url_token)?;
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| LedgerError::MalformedCallback(format!("invalid JSON: {}", e)))?;
        parse_daraja_callback(&value)
    }

    async fn query_status(
        &self,
        kind: RecordKind,
        external_reference: &str,
    ) -> Result<GatewayStatus, GatewayError> {
        if kind == RecordKind::BankTransfer {
            // B2C status arrives only through the result callback
            return Ok(GatewayStatus::Unknown);
        }

        let (password, timestamp) = self.stk_credentials();
        let body = json!({
            "BusinessShortCode": self.config.business_short_code,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": external_reference,
        });

        match self.post("/mpesa/stkpushquery/v1/query", &body).await {
            Ok(response) => Ok(interpret_stk_query(external_reference, &response)),
            Err(GatewayError::Rejected(msg)) if msg.contains(STK_QUERY_IN_PROGRESS) => {
                Ok(GatewayStatus::InProgress)
            }
            Err(e) => {
                warn!(external_reference, error = %e, "STK status query failed");
                Err(e)
            }
        }
    }
}

fn http_error(status: reqwest::StatusCode, body: &str) -> GatewayError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        // Upstream never took the request
        503 => GatewayError::Unreachable(detail),
        502 | 504 => GatewayError::Indeterminate(detail),
        _ => GatewayError::Rejected(detail),
    }
}

fn accepted(response: &Value, reference_field: &str) -> Result<GatewayAcceptance, GatewayError> {
    let code = response
        .get("ResponseCode")
        .map(value_as_string)
        .unwrap_or_default();
    if code != "0" {
        let description = response
            .get("ResponseDescription")
            .or_else(|| response.get("errorMessage"))
            .map(value_as_string)
            .unwrap_or_else(|| "no description".to_string());
        return Err(GatewayError::Rejected(format!(
            "ResponseCode {}: {}",
            code, description
        )));
    }

    let external_reference = response
        .get(reference_field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Rejected(format!("response missing {}", reference_field)))?;

    Ok(GatewayAcceptance {
        external_reference: external_reference.to_string(),
        queued: true,
    })
}

/// `YYYYMMDDHHMMSS` in East Africa Time, as Daraja expects.
pub fn daraja_timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// base64(shortcode + passkey + timestamp)
pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn result_code(v: Option<&Value>) -> Result<String, LedgerError> {
    v.map(value_as_string)
        .ok_or_else(|| LedgerError::MalformedCallback("missing ResultCode".into()))
}

/// Normalise an STK push or B2C result callback.
pub fn parse_daraja_callback(value: &Value) -> Result<CallbackOutcome, LedgerError> {
    if let Some(stk) = value.pointer("/Body/stkCallback") {
        let reference = stk
            .get("CheckoutRequestID")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::MalformedCallback("missing CheckoutRequestID".into()))?;
        let code = result_code(stk.get("ResultCode"))?;

        let mut settled_amount = None;
        let mut receipt = None;
        if let Some(items) = stk.pointer("/CallbackMetadata/Item").and_then(Value::as_array) {
            for item in items {
                let value = item.get("Value");
                match item.get("Name").and_then(Value::as_str) {
                    Some("Amount") => settled_amount = value.and_then(value_as_decimal),
                    Some("MpesaReceiptNumber") => receipt = value.map(value_as_string),
                    _ => {}
                }
            }
        }

        return Ok(CallbackOutcome {
            external_reference: reference.to_string(),
            outcome: if code == "0" {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            settled_amount,
            receipt,
            description: stk.get("ResultDesc").map(value_as_string),
        });
    }

    if let Some(result) = value.get("Result") {
        let reference = result
            .get("ConversationID")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::MalformedCallback("missing ConversationID".into()))?;
        let code = result_code(result.get("ResultCode"))?;

        let mut settled_amount = None;
        let mut receipt = result
            .get("TransactionID")
            .map(value_as_string)
            .filter(|s| !s.is_empty());
        if let Some(params) = result
            .pointer("/ResultParameters/ResultParameter")
            .and_then(Value::as_array)
        {
            for param in params {
                let value = param.get("Value");
                match param.get("Key").and_then(Value::as_str) {
                    Some("TransactionAmount") => settled_amount = value.and_then(value_as_decimal),
                    Some("TransactionReceipt") => receipt = value.map(value_as_string),
                    _ => {}
                }
            }
        }

        return Ok(CallbackOutcome {
            external_reference: reference.to_string(),
            outcome: if code == "0" {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            settled_amount,
            receipt,
            description: result.get("ResultDesc").map(value_as_string),
        });
    }

    Err(LedgerError::MalformedCallback(
        "neither Body.stkCallback nor Result present".into(),
    ))
}

/// Map an STK push query response to a status.
pub fn interpret_stk_query(external_reference: &str, response: &Value) -> GatewayStatus {
    let Some(code) = response.get("ResultCode").map(value_as_string) else {
        return GatewayStatus::InProgress;
    };
    GatewayStatus::Settled(CallbackOutcome {
        external_reference: external_reference.to_string(),
        outcome: if code == "0" {
            Outcome::Success
        } else {
            Outcome::Failure
        },
        settled_amount: None,
        receipt: None,
        description: response.get("ResultDesc").map(value_as_string),
    })
}
