//! Redemption services
//!
//! - [`RedemptionQuotaTracker`] - global and per-user caps
//! - [`FraudScoringEngine`] - risk scoring over attempt history
//! - [`RedemptionCoordinator`] - the end-to-end redemption flow

mod coordinator;
mod fraud;
mod policy;
mod quota;

pub use coordinator::RedemptionCoordinator;
pub use fraud::{FraudConfig, FraudScoringEngine, HistorySnapshot, ScoringInput, MAX_WINDOW_SECS};
pub use policy::RedemptionPolicy;
pub use quota::{QuotaError, RedemptionQuotaTracker, ReservationToken};
