//! Redemption quota enforcement.
//!
//! The tracker is a pure check over a voucher snapshot taken inside the
//! store's critical section (row lock or per-voucher mutex). It never
//! mutates anything: the reserved slot is written by the same atomic unit
//! that writes the redemption record, so an aborted attempt leaves no
//! dangling increment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{UserId, Voucher, VoucherId};

/// A reservation that would exceed a cap
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("voucher {voucher_id} has reached its limit of {max} redemption(s)")]
    GlobalLimitReached { voucher_id: VoucherId, max: u32 },

    #[error("user {user_id} has reached the limit of {max} redemption(s) for voucher {voucher_id}")]
    UserLimitReached {
        voucher_id: VoucherId,
        user_id: UserId,
        max: u32,
    },
}

/// One reserved redemption slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    /// Value of `current_redemptions` once committed
    pub slot: u32,
    /// The user's redemption count once committed
    pub user_slot: u32,
    /// Global slots left after this one (`None` = unlimited)
    pub remaining: Option<u32>,
}

impl ReservationToken {
    /// True when this reservation consumes the last global slot
    pub fn exhausts_quota(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Checks global and per-user caps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedemptionQuotaTracker;

impl RedemptionQuotaTracker {
    pub fn new() -> Self {
        Self
    }

    /// Reserve one slot on `voucher` for `user_id`.
    ///
    /// `prior_user_redemptions` must be counted under the same lock as the
    /// voucher snapshot.
    pub fn reserve(
        &self,
        voucher: &Voucher,
        user_id: &UserId,
        prior_user_redemptions: u32,
    ) -> Result<ReservationToken, QuotaError> {
        if let Some(max) = voucher.max_redemptions {
            if voucher.current_redemptions >= max {
                return Err(QuotaError::GlobalLimitReached {
                    voucher_id: voucher.id,
                    max,
                });
            }
        }

        if prior_user_redemptions >= voucher.max_redemptions_per_user {
            return Err(QuotaError::UserLimitReached {
                voucher_id: voucher.id,
                user_id: *user_id,
                max: voucher.max_redemptions_per_user,
            });
        }

        let slot = voucher.current_redemptions.saturating_add(1);
        Ok(ReservationToken {
            voucher_id: voucher.id,
            user_id: *user_id,
            slot,
            user_slot: prior_user_redemptions + 1,
            remaining: voucher.max_redemptions.map(|max| max - slot),
        })
    }
}
