//! Business logic services for smsgate
//!
//! This crate orchestrates the ledger, the reservation cache, the work queue
//! and the carrier into the gateway's two halves: synchronous intake and
//! asynchronous settlement.
//!
//! # Architecture
//!
//! Services depend only on the capability traits in `smsgate-core`:
//! - Each service owns `Arc<dyn Trait>` handles to its dependencies
//! - Services are wrapped in Arc for safe sharing across async tasks
//! - Ledger calls run under a bounded retry budget for transient errors
//! - Background loops stop on a shared `CancellationToken`
//!
//! # Services
//!
//! - `AdmissionService` - Tier lookup and up-front reservation
//! - `DispatchRouter` - Lane routing and publish with compensation
//! - `Gateway` - Intake facade used by the HTTP layer
//! - `SettlementProcessor` - Delivery and post-delivery billing per record
//! - `SettlementWorker` - Partition ownership and consumption for one lane
//! - `ReservationSweeper` - Reclamation of expired reservations

pub mod admission;
pub mod delivery;
pub mod gateway;
pub mod retry;
pub mod router;
pub mod settlement;
pub mod sweeper;
pub mod worker;

pub use admission::{
    build_strategy, AdmissionService, CacheAssistedReserver, LedgerOnlyReserver,
    ReservationStrategy,
};
pub use delivery::{build_delivery_channel, HttpCarrier, SimulatedCarrier};
pub use gateway::{Gateway, SubmitOutcome};
pub use retry::RetryPolicy;
pub use router::DispatchRouter;
pub use settlement::{Settlement, SettlementProcessor, StatsSnapshot, WorkerStats};
pub use sweeper::ReservationSweeper;
pub use worker::{fair_share, SettlementWorker};
