//! Balance and plan catalogue handlers

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Extension,
    extract::{Query, State, rejection::QueryRejection},
};

use super::super::auth::AuthenticatedOwner;
use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, BalanceView, PlansQuery, ok};
use crate::catalog::{PlanCategory, ServicePlan};
use crate::money::format_kes;

/// Balance derived from completed records, plus active service entitlements
#[utoipa::path(
    get,
    path = "/balance",
    responses(
        (status = 200, description = "Balance snapshot", body = BalanceView),
        (status = 401, description = "Authentication failed")
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedOwner(owner)): Extension<AuthenticatedOwner>,
) -> ApiResult<BalanceView> {
    let snapshot = state.engine.balance(&owner).await?;
    let entitlements = state.engine.entitlements(&owner).await?;
    ok(BalanceView {
        display: format_kes(snapshot.available_balance),
        snapshot,
        entitlements,
    })
}

/// Service plan catalogue
#[utoipa::path(
    get,
    path = "/plans",
    params(PlansQuery),
    responses(
        (status = 200, description = "Available plans", body = Vec<ServicePlan>),
        (status = 400, description = "Unknown category")
    ),
    tag = "Plans"
)]
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PlansQuery>, QueryRejection>,
) -> ApiResult<Vec<ServicePlan>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let catalog = state.engine.catalog();
    let plans = match query.category.as_deref() {
        Some(raw) => {
            let category = PlanCategory::from_str(raw).map_err(ApiError::bad_request)?;
            catalog.by_category(category)
        }
        None => catalog.all().to_vec(),
    };
    ok(plans)
}
