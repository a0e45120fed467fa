//! Voucher Redemption Library
//!
//! Voucher lifecycle, race-safe redemption quotas and fraud scoring for a
//! voucher marketplace.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (vouchers, codes, fraud flags, records)
//! - [`infra`] - Ports, errors, storage adapters (PostgreSQL, in-memory) and workers
//! - [`redemption`] - Quota tracker, fraud scoring engine and redemption coordinator
//! - [`metrics`] - In-process metrics
//! - [`telemetry`] - Structured logging setup
//! - [`daemon`] - `voucherd` bootstrap

pub mod daemon;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod redemption;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    BusinessId, CategoryId, CodeType, FraudCase, FraudDecision, FraudFlag, GeoPoint,
    RedemptionContext, RedemptionOutcome, UserId, Voucher, VoucherCode, VoucherId, VoucherState,
    VoucherStateMachine,
};

pub use infra::{
    Clock, FraudCaseSink, FraudHistory, InMemoryRedemptionStore, PgRedemptionStore,
    RedemptionError, Result, VoucherRepository,
};

pub use redemption::{
    FraudScoringEngine, RedemptionCoordinator, RedemptionPolicy, RedemptionQuotaTracker,
};
