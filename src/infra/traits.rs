//! Ports consumed by the redemption core

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    AttemptSummary, CodeMatch, FraudCase, FraudCaseId, RedemptionId, RedemptionRecord, UserId,
    Voucher, VoucherId, VoucherState,
};

use super::Result;

/// Decides the writes of one redemption, given the voucher as it is
/// *inside* the store's critical section.
///
/// Implementations must be pure: the store may call `plan` more than once
/// when it retries, and nothing is written if `plan` fails.
pub trait CommitMutation: Send + Sync {
    fn plan(&self, voucher: &Voucher, prior_user_redemptions: u32) -> Result<CommitPlan>;
}

/// Writes produced by a [`CommitMutation`], applied all-or-nothing
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub next_state: VoucherState,
    pub next_redemptions: u32,
    pub record: RedemptionRecord,
    pub attempt: AttemptSummary,
    /// Review case opened alongside an accepted redemption
    pub review_case: Option<FraudCase>,
}

/// What the store committed
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub voucher: Voucher,
    pub record_id: RedemptionId,
    pub review_case_id: Option<FraudCaseId>,
}

/// Voucher persistence.
///
/// Invariant: `current_redemptions` and `state` only change inside
/// `atomic_reserve_and_commit` or `compare_and_set_state`, and both
/// serialize per voucher id.
#[async_trait]
pub trait VoucherRepository: Send + Sync {
    /// Exact match across all code types, active or not
    async fn find_by_code(&self, code: &str) -> Result<Option<CodeMatch>>;

    async fn get(&self, voucher_id: &VoucherId) -> Result<Option<Voucher>>;

    /// Store a new voucher; fails `DuplicateCode` if any code is taken
    async fn insert(&self, voucher: &Voucher) -> Result<()>;

    async fn user_redemption_count(&self, voucher_id: &VoucherId, user_id: &UserId)
        -> Result<u32>;

    /// Lock the voucher, let `mutation` plan the writes against the locked
    /// row, and apply them in one atomic unit.
    ///
    /// Either everything in the plan is committed or nothing is.
    async fn atomic_reserve_and_commit(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
        mutation: &dyn CommitMutation,
    ) -> Result<CommitReceipt>;

    /// Set `state = next` and `updated_at = at` only if the state is still
    /// `expected`; `Conflict` otherwise
    async fn compare_and_set_state(
        &self,
        voucher_id: &VoucherId,
        expected: VoucherState,
        next: VoucherState,
        at: DateTime<Utc>,
    ) -> Result<Voucher>;

    /// Non-terminal vouchers whose `expires_at` is before `now`
    async fn list_expirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Voucher>>;

    /// Remove a voucher; fails `VoucherInUse` once it has been redeemed
    async fn delete(&self, voucher_id: &VoucherId) -> Result<()>;

    async fn redemptions_for(&self, voucher_id: &VoucherId) -> Result<Vec<RedemptionRecord>>;
}

/// History lookup key for the fraud engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HistoryKey {
    User(UserId),
    Device(String),
    Voucher(VoucherId),
}

/// Attempt log read by the fraud engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FraudHistory: Send + Sync {
    /// Attempts for `key` at or after `since`, oldest first
    async fn recent_attempts(
        &self,
        key: &HistoryKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptSummary>>;

    /// Log an attempt that did not reach the commit (rejected or declined)
    async fn record_attempt(&self, attempt: &AttemptSummary) -> Result<()>;
}

/// Destination for fraud cases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FraudCaseSink: Send + Sync {
    async fn create(&self, case: &FraudCase) -> Result<FraudCaseId>;
}

/// Injectable time source
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
