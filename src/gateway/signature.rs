//! Callback signature verification
//!
//! Webhook bodies carry `X-Callback-Signature: sha256=<hex(HMAC-SHA256(secret, body))>`.
//! Providers that cannot sign (Daraja) instead echo a token that was placed
//! in the registered callback URL. Both comparisons are constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::ledger::error::LedgerError;

/// Header carrying the callback signature
pub const SIGNATURE_HEADER: &str = "x-callback-signature";

const PREFIX: &str = "sha256=";

/// Label the URL token is derived from, so the raw secret never leaves the process
const URL_TOKEN_LABEL: &[u8] = b"callback-url-token:v1";

type HmacSha256 = Hmac<Sha256>;

/// Shared-secret verifier for gateway callbacks
#[derive(Clone)]
pub struct CallbackVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier").finish_non_exhaustive()
    }
}

impl CallbackVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, LedgerError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LedgerError::ServiceUnavailable(format!("callback key: {}", e)))
    }

    /// Signature header value for `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String, LedgerError> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(format!(
            "{}{}",
            PREFIX,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// Verify `signature` against `body`; any problem is a `MalformedCallback`.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<(), LedgerError> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LedgerError::MalformedCallback("missing signature".into()))?;

        let hex_part = signature.strip_prefix(PREFIX).unwrap_or(signature);
        let expected = hex::decode(hex_part)
            .map_err(|_| LedgerError::MalformedCallback("signature is not hex".into()))?;

        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| LedgerError::MalformedCallback("signature mismatch".into()))
    }

    /// Token to embed as `?token=` in a callback URL handed to the provider.
    pub fn url_token(&self) -> Result<String, LedgerError> {
        let mut mac = self.mac()?;
        mac.update(URL_TOKEN_LABEL);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check the token echoed back on the callback URL.
    pub fn verify_url_token(&self, token: Option<&str>) -> Result<(), LedgerError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LedgerError::MalformedCallback("missing callback token".into()))?;
        let presented = hex::decode(token)
            .map_err(|_| LedgerError::MalformedCallback("callback token is not hex".into()))?;

        let mut mac = self.mac()?;
        mac.update(URL_TOKEN_LABEL);
        mac.verify_slice(&presented)
            .map_err(|_| LedgerError::MalformedCallback("callback token mismatch".into()))
    }
}
