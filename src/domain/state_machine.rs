//! Voucher lifecycle transitions.
//!
//! ```text
//! NEW        -> PUBLISHED, EXPIRED
//! PUBLISHED  -> CLAIMED, EXPIRED
//! CLAIMED    -> REDEEMED, EXPIRED
//! REDEEMED   -> (terminal)
//! EXPIRED    -> (terminal, EXPIRED -> EXPIRED is a no-op)
//! ```

use thiserror::Error;

use super::VoucherState;

/// Rejected lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: VoucherState, to: VoucherState },
}

/// Stateless validator for voucher lifecycle changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoucherStateMachine;

impl VoucherStateMachine {
    /// Validate `from -> to` and return the resulting state.
    pub fn transition(
        from: VoucherState,
        to: VoucherState,
    ) -> Result<VoucherState, TransitionError> {
        if Self::can_transition(from, to) {
            Ok(to)
        } else {
            Err(TransitionError::InvalidTransition { from, to })
        }
    }

    pub fn can_transition(from: VoucherState, to: VoucherState) -> bool {
        use VoucherState::*;

        matches!(
            (from, to),
            (New, Published)
                | (New, Expired)
                | (Published, Claimed)
                | (Published, Expired)
                | (Claimed, Redeemed)
                | (Claimed, Expired)
                | (Expired, Expired)
        )
    }

    /// All states reachable from `from` in one step (excluding the
    /// EXPIRED self-loop).
    pub fn legal_targets(from: VoucherState) -> Vec<VoucherState> {
        VoucherState::ALL
            .into_iter()
            .filter(|to| *to != from && Self::can_transition(from, *to))
            .collect()
    }

    /// Whether a redemption may start from `state`.
    ///
    /// CLAIMED always qualifies; PUBLISHED only when direct redemption
    /// (without a prior claim) is enabled.
    pub fn permits_redemption(state: VoucherState, allow_direct: bool) -> bool {
        match state {
            VoucherState::Claimed => true,
            VoucherState::Published => allow_direct,
            _ => false,
        }
    }

    /// Path of single-step transitions taking `from` to REDEEMED.
    pub fn redemption_path(
        from: VoucherState,
        allow_direct: bool,
    ) -> Result<Vec<VoucherState>, TransitionError> {
        match from {
            VoucherState::Claimed => Ok(vec![VoucherState::Redeemed]),
            VoucherState::Published if allow_direct => {
                Ok(vec![VoucherState::Claimed, VoucherState::Redeemed])
            }
            _ => Err(TransitionError::InvalidTransition {
                from,
                to: VoucherState::Redeemed,
            }),
        }
    }
}
