//! Shared application state

use std::sync::Arc;

use super::auth::JwtVerifier;
use crate::gateway::PaymentGateway;
use crate::ledger::{CallbackSender, LedgerEngine};

pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    /// Same gateway the engine uses; the webhook needs it to verify callbacks
    pub gateway: Arc<dyn PaymentGateway>,
    pub callbacks: CallbackSender,
    pub jwt: JwtVerifier,
}

impl AppState {
    pub fn new(engine: Arc<LedgerEngine>, callbacks: CallbackSender, jwt: JwtVerifier) -> Self {
        Self {
            gateway: engine.gateway().clone(),
            engine,
            callbacks,
            jwt,
        }
    }
}
