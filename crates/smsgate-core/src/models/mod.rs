//! Domain models for smsgate
//!
//! This module contains all the core domain models used throughout the application.

pub mod admission;
pub mod lane;
pub mod message;
pub mod reservation;
pub mod user;

pub use admission::{
    AdmissionDecision, ClaimOutcome, LedgerReserve, PrivilegedSettlement, ReclaimedReservation,
};
pub use lane::{Lane, Submission};
pub use message::{Message, MessageStatus};
pub use reservation::Reservation;
pub use user::{User, UserId, UserSnapshot};
