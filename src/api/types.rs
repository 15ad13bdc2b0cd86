//! API request/response types and error codes
//!
//! - `ApiResponse<T>`: unified `{code, msg, data}` envelope
//! - `ApiError`: envelope-shaped error with its HTTP status
//! - request and response DTOs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::{IntoParams, ToSchema};

use crate::ledger::projector::{BalanceSnapshot, Entitlements};
use crate::ledger::types::{Direction, LedgerRecord, RecordKind};
use crate::ledger::LedgerError;
use crate::money::{Amount, format_kes};

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message
/// - data: payload on success; on some errors the affected record
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    #[schema(example = 0)]
    pub code: i32,
    #[schema(example = "ok")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INVALID_AMOUNT: i32 = 1002;
    pub const IDEMPOTENCY_CONFLICT: i32 = 1003;
    pub const INVALID_TRANSITION: i32 = 1004;
    pub const MALFORMED_CALLBACK: i32 = 1005;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const GATEWAY_ERROR: i32 = 5002;
}

// ============================================================================
// Errors
// ============================================================================

/// Error response carrying its HTTP status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
            data: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match &e {
            LedgerError::Validation(_) => error_codes::INVALID_PARAMETER,
            LedgerError::InvalidAmount(_) => error_codes::INVALID_AMOUNT,
            LedgerError::IdempotencyConflict { .. } => error_codes::IDEMPOTENCY_CONFLICT,
            LedgerError::InvalidTransition { .. } => error_codes::INVALID_TRANSITION,
            LedgerError::MalformedCallback(_) => error_codes::MALFORMED_CALLBACK,
            LedgerError::Unauthorized => error_codes::AUTH_FAILED,
            LedgerError::Forbidden => error_codes::FORBIDDEN,
            LedgerError::NotFound(_) => error_codes::NOT_FOUND,
            LedgerError::Gateway(_) => error_codes::GATEWAY_ERROR,
            LedgerError::ServiceUnavailable(_) => error_codes::SERVICE_UNAVAILABLE,
            LedgerError::StateConflict { .. } | LedgerError::Storage(_) => {
                error_codes::INTERNAL_ERROR
            }
        };
        // Internal races and storage details stay in the logs
        let msg = match &e {
            LedgerError::StateConflict { .. } | LedgerError::Storage(_) => {
                tracing::error!(error = %e, "Request failed with internal error");
                "internal error".to_string()
            }
            _ => e.to_string(),
        };
        Self {
            status,
            code,
            msg,
            data: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse {
            code: self.code,
            msg: self.msg,
            data: self.data,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

pub fn created<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::CREATED, Json(ApiResponse::success(data))))
}

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /transfers`
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransferBody {
    /// Unique per owner; retries must reuse it
    #[schema(example = "K1")]
    pub idempotency_key: String,
    /// `ServicePurchase`, `BankTransfer` or `MobileMoneyPush`
    #[schema(value_type = String, example = "BankTransfer")]
    pub kind: RecordKind,
    /// Defaults to the kind's natural direction
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "debit")]
    pub direction: Option<Direction>,
    /// Decimal string or number, at most 2 decimal places
    #[schema(value_type = String, example = "500.00")]
    pub amount: Amount,
    /// MSISDN; bank transfers pay the number linked to `metadata.bankAccountId`
    #[schema(example = "254712345678")]
    pub destination: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// 1-100, default 20
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsQuery {
    /// `today`, `week`, `month` or `year`; default `month`
    pub period: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    /// Token embedded in the callback URL registered with Daraja
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PlansQuery {
    /// `data`, `sms` or `bonga`
    pub category: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Minimal create result
#[derive(Debug, Serialize, ToSchema)]
pub struct TransferAck {
    #[schema(example = "01HV3K8Z9X4Q2W5E7R1T3Y6U8I")]
    pub id: String,
    #[schema(example = "PENDING")]
    pub state: String,
}

impl From<&LedgerRecord> for TransferAck {
    fn from(r: &LedgerRecord) -> Self {
        Self {
            id: r.id.to_string(),
            state: r.state.as_str().to_string(),
        }
    }
}

/// Ledger record as returned to its owner
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferView {
    pub id: String,
    pub owner_id: String,
    #[schema(example = "BankTransfer")]
    pub kind: String,
    #[schema(example = "debit")]
    pub direction: String,
    #[schema(example = "500.00")]
    pub amount: String,
    #[schema(example = "KES 500.00")]
    pub amount_display: String,
    pub destination: String,
    pub external_reference: Option<String>,
    pub idempotency_key: String,
    #[schema(example = "COMPLETED")]
    pub state: String,
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
    pub pending_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&LedgerRecord> for TransferView {
    fn from(r: &LedgerRecord) -> Self {
        Self {
            id: r.id.to_string(),
            owner_id: r.owner_id.to_string(),
            kind: r.kind.as_str().to_string(),
            direction: r.direction.as_str().to_string(),
            amount: r.amount.to_string(),
            amount_display: format_kes(r.amount.value()),
            destination: r.destination.clone(),
            external_reference: r.external_reference.clone(),
            idempotency_key: r.idempotency_key.clone(),
            state: r.state.as_str().to_string(),
            metadata: r.metadata.clone(),
            error: r.error.clone(),
            pending_deadline: r.pending_deadline,
            created_at: r.created_at,
            updated_at: r.updated_at,
            completed_at: r.completed_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferPage {
    pub items: Vec<TransferView>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    #[serde(flatten)]
    pub snapshot: BalanceSnapshot,
    #[schema(example = "KES 1,250.00")]
    pub display: String,
    pub entitlements: Entitlements,
}

/// Acknowledgement body expected by Daraja-style webhooks
#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            result_code: 1,
            result_desc: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;

    #[test]
    fn test_ledger_errors_map_to_envelope() {
        let e: ApiError = LedgerError::NotFound("ledger record X".into()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.code, error_codes::NOT_FOUND);

        let e: ApiError = LedgerError::Gateway(GatewayError::Timeout).into();
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);

        let e: ApiError = LedgerError::Gateway(GatewayError::Rejected("no".into())).into();
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_storage_details_are_hidden() {
        let e: ApiError = LedgerError::Storage("connection refused at 10.0.0.3".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.msg, "internal error");
    }

    #[test]
    fn test_create_body_accepts_number_amount() {
        let body: CreateTransferBody = serde_json::from_str(
            r#"{"idempotencyKey":"K1","kind":"BankTransfer","amount":500,"destination":"254712345678"}"#,
        )
        .unwrap();
        assert_eq!(body.amount.to_string(), "500.00");
        assert!(body.direction.is_none());
        assert!(body.metadata.is_none());
    }

    #[test]
    fn test_callback_ack_shape() {
        let json = serde_json::to_value(CallbackAck::accepted()).unwrap();
        assert_eq!(json, serde_json::json!({"ResultCode": 0, "ResultDesc": "Accepted"}));
    }
}
