//! Owner authentication
//!
//! Tokens are issued by the identity provider; this service only verifies
//! HS256 signatures and expiry, then trusts the `sub` claim as the owner id.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::types::{ApiResponse, error_codes};
use crate::ledger::LedgerError;
use crate::ledger::types::OwnerId;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

/// Verified owner, inserted into request extensions by [`jwt_auth_middleware`]
#[derive(Debug, Clone)]
pub struct AuthenticatedOwner(pub OwnerId);

#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, LedgerError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| LedgerError::Unauthorized)?;
        if data.claims.sub.trim().is_empty() {
            return Err(LedgerError::Unauthorized);
        }
        Ok(data.claims)
    }

    /// Sign a token for `owner`, valid for `ttl_secs`. Used by local tooling and tests.
    pub fn issue(&self, owner: &str, ttl_secs: u64) -> Result<String, LedgerError> {
        let now = chrono::Utc::now().timestamp().max(0) as usize;
        let claims = Claims {
            sub: owner.to_string(),
            iat: now,
            exp: now + ttl_secs as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| LedgerError::ServiceUnavailable(format!("token signing: {}", e)))
    }
}

fn unauthorized(code: i32, msg: &str) -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error(code, msg)),
    )
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, Json<ApiResponse<()>>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized(error_codes::MISSING_AUTH, "Missing Authorization header"))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(error_codes::AUTH_FAILED, "Invalid token format"))?;

    match state.jwt.verify(token.trim()) {
        Ok(claims) => {
            request
                .extensions_mut()
                .insert(AuthenticatedOwner(OwnerId::new(claims.sub)));
            Ok(next.run(request).await)
        }
        Err(_) => Err(unauthorized(
            error_codes::AUTH_FAILED,
            "Invalid or expired token",
        )),
    }
}
