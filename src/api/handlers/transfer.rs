//! Transfer handlers

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
};
use tracing::info;

use super::super::auth::AuthenticatedOwner;
use super::super::state::AppState;
use super::super::types::{
    ApiError, ApiResult, CreateTransferBody, ListQuery, StatsQuery, TransferAck, TransferPage,
    TransferView, created, ok,
};
use crate::ledger::LedgerError;
use crate::ledger::projector::{StatsPeriod, TransferStats};
use crate::ledger::types::{LedgerRecordId, TransferRequest};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

fn parse_id(raw: &str) -> Result<LedgerRecordId, ApiError> {
    // A malformed id cannot name an existing record
    LedgerRecordId::from_str(raw)
        .map_err(|_| LedgerError::NotFound(format!("ledger record {}", raw)).into())
}

/// Create a transfer, purchase or push payment
///
/// Replaying the same idempotency key with the same payload returns the
/// original record with `200`.
#[utoipa::path(
    post,
    path = "/transfers",
    request_body = CreateTransferBody,
    responses(
        (status = 201, description = "Record created", body = TransferAck),
        (status = 200, description = "Idempotent replay", body = TransferAck),
        (status = 400, description = "Validation failed"),
        (status = 401, description = "Authentication failed"),
        (status = 409, description = "Idempotency key reused with a different payload"),
        (status = 502, description = "Gateway rejected the request; record is FAILED"),
        (status = 503, description = "Gateway unreachable; record is FAILED")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfers"
)]
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
    body: Result<Json<CreateTransferBody>, JsonRejection>,
) -> ApiResult<TransferAck> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let req = TransferRequest {
        owner_id: owner,
        idempotency_key: body.idempotency_key,
        kind: body.kind,
        direction: body.direction.unwrap_or(body.kind.default_direction()),
        amount: body.amount,
        destination: body.destination,
        metadata: body.metadata.unwrap_or_default(),
    };

    let outcome = state.engine.create(req).await?;
    let ack = TransferAck::from(&outcome.record);

    if let Some(e) = outcome.gateway_error {
        return Err(ApiError::from(LedgerError::Gateway(e)).with_data(ack));
    }
    if outcome.replayed {
        return ok(ack);
    }
    created(ack)
}

/// List the caller's records, newest first
#[utoipa::path(
    get,
    path = "/transfers",
    params(ListQuery),
    responses(
        (status = 200, description = "Page of records", body = TransferPage),
        (status = 401, description = "Authentication failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfers"
)]
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<TransferPage> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let offset = query.offset.unwrap_or(0);

    let (records, total) = state.engine.list(&owner, limit, offset).await?;
    ok(TransferPage {
        items: records.iter().map(TransferView::from).collect(),
        total,
        limit,
        offset,
    })
}

/// Completed-movement totals for a period
#[utoipa::path(
    get,
    path = "/transfers/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Period summary", body = TransferStats),
        (status = 400, description = "Unknown period"),
        (status = 401, description = "Authentication failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfers"
)]
pub async fn transfer_stats(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<TransferStats> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let period = match query.period.as_deref() {
        Some(p) => StatsPeriod::from_str(p)?,
        None => StatsPeriod::Month,
    };
    ok(state.engine.stats(&owner, period).await?)
}

/// Fetch one of the caller's records
#[utoipa::path(
    get,
    path = "/transfers/{id}",
    params(("id" = String, Path, description = "Ledger record id")),
    responses(
        (status = 200, description = "Record", body = TransferView),
        (status = 401, description = "Authentication failed"),
        (status = 403, description = "Record belongs to another owner"),
        (status = 404, description = "Unknown record")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfers"
)]
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
    Path(id): Path<String>,
) -> ApiResult<TransferView> {
    let id = parse_id(&id)?;
    let record = state.engine.get_for_owner(&owner, id).await?;
    ok(TransferView::from(&record))
}

/// Cancel a record the gateway has not seen yet
#[utoipa::path(
    post,
    path = "/transfers/{id}/cancel",
    params(("id" = String, Path, description = "Ledger record id")),
    responses(
        (status = 200, description = "Record cancelled", body = TransferView),
        (status = 403, description = "Record belongs to another owner"),
        (status = 404, description = "Unknown record"),
        (status = 409, description = "Record already reached the gateway")
    ),
    security(("bearer_auth" = [])),
    tag = "Transfers"
)]
pub async fn cancel_transfer(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
    Path(id): Path<String>,
) -> ApiResult<TransferView> {
    let id = parse_id(&id)?;
    let record = state.engine.cancel(&owner, id).await?;
    info!(record_id = %id, owner_id = %owner, "Transfer cancelled via API");
    ok(TransferView::from(&record))
}
