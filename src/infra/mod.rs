//! Infrastructure layer for the redemption core
//!
//! Contains port definitions and implementations for:
//! - Voucher storage (PostgreSQL, in-memory)
//! - Fraud attempt history and fraud case sink
//! - Clocks (system, manual)
//! - Retry with backoff for store conflicts
//! - Expiry sweeping (background worker)

mod clock;
mod error;
mod expiry_sweeper;
mod memory;
pub mod postgres;
mod retry;
mod traits;

pub use clock::{ManualClock, SystemClock};
pub use error::*;
pub use expiry_sweeper::{
    spawn_expiry_sweeper, ExpirySweeper, ExpirySweeperConfig, ExpirySweeperMessage, SweepReport,
};
pub use memory::InMemoryRedemptionStore;
pub use postgres::PgRedemptionStore;
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult, MAX_RETRIES};
pub use traits::*;
