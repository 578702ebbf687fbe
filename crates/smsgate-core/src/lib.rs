//! smsgate Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the smsgate message gateway. It includes:
//!
//! - Domain models (User, Message, Reservation, Lane, Submission)
//! - Capability traits for the ledger, the reservation cache, the work
//!   queue and the delivery channel
//! - Unified error handling with HTTP response mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
