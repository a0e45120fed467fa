//! PostgreSQL implementations for production storage
//!
//! Provides the voucher repository, fraud attempt log and fraud case sink
//! backing the redemption service.

mod redemption_store;

pub use redemption_store::*;
