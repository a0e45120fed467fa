//! Domain models for voucher redemption
//!
//! Pure types with no I/O: vouchers and their lifecycle, redemption
//! attempts and records, fraud flags and cases.

mod fraud;
mod redemption;
mod state_machine;
mod types;
mod voucher;

pub use fraud::*;
pub use redemption::*;
pub use state_machine::*;
pub use types::*;
pub use voucher::*;
