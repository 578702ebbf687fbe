//! smsgate Ledger Store
//!
//! This crate provides the authoritative ledger behind admission and
//! settlement. It includes:
//!
//! - Connection pool management and schema migrations with sqlx
//! - `PgLedger`, the PostgreSQL implementation of `LedgerStore`
//! - `MemoryLedger`, an in-process implementation with the same semantics
//! - Classification of driver errors into the gateway's error taxonomy

mod errors;
pub mod memory;
pub mod pg_ledger;
pub mod pool;

pub use errors::classify_sqlx_error;
pub use memory::MemoryLedger;
pub use pg_ledger::PgLedger;
pub use pool::{create_pool, run_migrations};

// Re-export commonly used types
pub use smsgate_core::{AppError, AppResult};
pub use sqlx::PgPool;
