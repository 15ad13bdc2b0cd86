//! Transfer / Purchase Ledger
//!
//! Every money movement (service purchase, bank transfer, M-Pesa push) is a
//! durable [`LedgerRecord`] driven by a small persistent FSM.
//!
//! # State Machine
//!
//! ```text
//! CREATED → SUBMITTED → PENDING → COMPLETED
//!    ↓                     ↓
//!  FAILED ←──────────── FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Single Mutation Path**: records change only through `compare_and_swap_state`
//! 2. **Effect Once**: the balance effect is applied only by the winning COMPLETED swap
//! 3. **Terminal Is Final**: COMPLETED and FAILED ignore every further event
//! 4. **Idempotent Creation**: one live record per `(owner_id, idempotency_key)`
//! 5. **Derived Balances**: the projector is rebuilt from COMPLETED records, never edited

pub mod callback_queue;
pub mod db;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod projector;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use callback_queue::{CallbackReceiver, CallbackSender, CallbackWorker, callback_channel};
pub use db::PgLedgerStore;
pub use engine::{CreateOutcome, EngineConfig, LedgerEngine, Transitioned};
pub use error::LedgerError;
pub use idempotency::{IdempotencyGuard, Reservation};
pub use projector::{BalanceProjector, BalanceSnapshot, Entitlements, StatsPeriod, TransferStats};
pub use state::{LedgerEvent, LedgerState};
pub use store::{InsertOutcome, LedgerStore, MemoryLedgerStore};
pub use types::{Direction, LedgerRecord, LedgerRecordId, OwnerId, RecordKind, TransferRequest};
pub use worker::{ExpirySweeper, SweepReport, SweeperConfig};
