//! Gateway webhook
//!
//! Authenticates and normalises the callback, queues it, and acknowledges
//! immediately. The state transition happens on the callback worker.
//!
//! The simulated gateway signs the body; Daraja echoes the `token` query
//! parameter of the URL it was given.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use tracing::{info, warn};

use super::super::state::AppState;
use super::super::types::{CallbackAck, CallbackQuery};
use crate::gateway::CallbackAuth;
use crate::gateway::signature::SIGNATURE_HEADER;

/// Payment gateway callback receiver
#[utoipa::path(
    post,
    path = "/gateway/callback",
    request_body(content = Object, description = "Gateway-specific callback payload", content_type = "application/json"),
    params(
        ("X-Callback-Signature" = Option<String>, Header, description = "sha256=<hex HMAC-SHA256 of the body>"),
        CallbackQuery
    ),
    responses(
        (status = 200, description = "Callback accepted for processing", body = CallbackAck),
        (status = 400, description = "Signature or payload rejected", body = CallbackAck),
        (status = 503, description = "Callback queue full or closed", body = CallbackAck)
    ),
    tag = "Gateway"
)]
pub async fn gateway_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<CallbackAck>) {
    let auth = CallbackAuth {
        signature: headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok()),
        url_token: query.token.as_deref(),
    };

    let outcome = match state.gateway.parse_callback(auth, &body) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                gateway = state.gateway.name(),
                error = %e,
                body_len = body.len(),
                "Rejected gateway callback"
            );
            return (StatusCode::BAD_REQUEST, Json(CallbackAck::rejected(e.to_string())));
        }
    };

    info!(
        external_reference = %outcome.external_reference,
        outcome = ?outcome.outcome,
        "Gateway callback accepted"
    );

    if let Err(e) = state.callbacks.try_enqueue(outcome) {
        warn!(error = %e, "Could not queue gateway callback");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(CallbackAck::rejected("temporarily unavailable")),
        );
    }

    (StatusCode::OK, Json(CallbackAck::accepted()))
}
