//! HTTP API
//!
//! | Route | Auth |
//! |---|---|
//! | `POST /transfers`, `GET /transfers`, `GET /transfers/stats` | JWT |
//! | `GET /transfers/{id}`, `POST /transfers/{id}/cancel`, `GET /balance` | JWT |
//! | `GET /plans`, `GET /health`, `GET /docs` | none |
//! | `POST /gateway/callback` | callback signature |

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use state::AppState;

/// Default request body limit for all routes
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

/// Build the complete router
pub fn create_router(state: Arc<AppState>, body_limit: usize) -> Router {
    let owner_routes = Router::new()
        .route(
            "/transfers",
            post(handlers::create_transfer).get(handlers::list_transfers),
        )
        .route("/transfers/stats", get(handlers::transfer_stats))
        .route("/transfers/{id}", get(handlers::get_transfer))
        .route("/transfers/{id}/cancel", post(handlers::cancel_transfer))
        .route("/balance", get(handlers::get_balance))
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/plans", get(handlers::list_plans))
        .route("/gateway/callback", post(handlers::gateway_callback))
        .merge(owner_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        // Stateless, added after with_state
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Bind and serve until the process exits.
pub async fn run_server(
    host: &str,
    port: u16,
    state: Arc<AppState>,
    body_limit: usize,
) -> anyhow::Result<()> {
    let app = create_router(state, body_limit);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(%addr, "Ledger API listening");
    info!("API docs: http://{}/docs", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
