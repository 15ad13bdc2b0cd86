//! M-Pesa+ ledger service
//!
//! Records every money movement (bank transfers, service purchases, push
//! payments) as an immutable ledger record driven through a small state
//! machine by an external payment gateway.
//!
//! # Modules
//!
//! - [`money`] - KES amounts with two-decimal precision
//! - [`msisdn`] - Kenyan phone number normalisation
//! - [`catalog`] - Data, SMS and Bonga service plans
//! - [`ledger`] - Records, state machine, idempotency, projector, workers
//! - [`gateway`] - Payment gateway trait, simulated and Daraja adapters
//! - [`api`] - HTTP surface (axum + utoipa)
//! - [`config`] / [`logging`] - YAML config and tracing setup

pub mod api;
pub mod catalog;
pub mod config;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod money;
pub mod msisdn;

pub use catalog::{PlanCatalog, PlanCategory, ServicePlan};
pub use config::AppConfig;
pub use ledger::{LedgerEngine, LedgerError, LedgerRecord, LedgerState};
pub use money::Amount;
