//! HTTP handlers

pub mod balance;
pub mod callback;
pub mod health;
pub mod transfer;

// Glob re-exports also bring in the `__path_*` items generated by utoipa
pub use balance::*;
pub use callback::*;
pub use health::*;
pub use transfer::*;
