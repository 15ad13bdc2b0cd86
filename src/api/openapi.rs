//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::handlers::HealthResponse;
use crate::api::types::{BalanceView, CallbackAck, CreateTransferBody, TransferAck, TransferPage, TransferView};
use crate::catalog::{PlanCategory, ServicePlan};
use crate::ledger::projector::{
    BalanceSnapshot, Entitlement, Entitlements, KindTotal, StatsPeriod, TransferStats,
};

/// Bearer JWT issued by the identity provider
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let mut scheme = Http::new(HttpAuthScheme::Bearer);
            scheme.bearer_format = Some("JWT".to_string());
            scheme.description =
                Some("HS256 token from the identity provider; `sub` is the owner id".to_string());
            components.add_security_scheme("bearer_auth", SecurityScheme::Http(scheme));
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "M-Pesa+ Ledger API",
        version = "1.0.0",
        description = "Transfer, purchase and push-payment ledger with idempotent creation, gateway callbacks and derived balances.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::api::handlers::health_check,
        crate::api::handlers::list_plans,
        crate::api::handlers::create_transfer,
        crate::api::handlers::list_transfers,
        crate::api::handlers::transfer_stats,
        crate::api::handlers::get_transfer,
        crate::api::handlers::cancel_transfer,
        crate::api::handlers::get_balance,
        crate::api::handlers::gateway_callback,
    ),
    components(
        schemas(
            HealthResponse,
            CreateTransferBody,
            TransferAck,
            TransferView,
            TransferPage,
            BalanceView,
            BalanceSnapshot,
            Entitlements,
            Entitlement,
            TransferStats,
            KindTotal,
            StatsPeriod,
            ServicePlan,
            PlanCategory,
            CallbackAck,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Transfers", description = "Create and inspect money movements (auth required)"),
        (name = "Account", description = "Derived balance and entitlements (auth required)"),
        (name = "Plans", description = "Service plan catalogue"),
        (name = "Gateway", description = "Payment gateway webhooks (signature required)"),
        (name = "System", description = "Health checks and system info")
    )
)]
pub struct ApiDoc;
