//! Error types for the redemption core

use std::time::Duration;

use thiserror::Error;

use crate::domain::{FraudCaseId, FraudFlag, TransitionError, VoucherId, VoucherState};
use crate::redemption::QuotaError;

use super::retry::is_retryable_db_error;

/// Broad classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller error; nothing was mutated
    Validation,
    /// Quota exhaustion or a store conflict
    Contention,
    /// Declined by fraud scoring
    Fraud,
    /// Backing store unavailable or failing
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Contention => "contention",
            Self::Fraud => "fraud",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// Errors that can occur while redeeming or administering vouchers
#[derive(Error, Debug)]
pub enum RedemptionError {
    /// No voucher carries the presented code
    #[error("code not found")]
    CodeNotFound,

    /// Voucher not found
    #[error("voucher not found: {0}")]
    VoucherNotFound(VoucherId),

    /// Outside the voucher's validity window
    #[error("voucher expired: {0}")]
    VoucherExpired(VoucherId),

    /// Current state does not allow redemption
    #[error("voucher {voucher_id} cannot be redeemed in state {state}")]
    InvalidState {
        voucher_id: VoucherId,
        state: VoucherState,
    },

    /// Administrative transition rejected by the state machine
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Global or per-user quota reached
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaError),

    /// Declined by fraud scoring. The message never names the heuristic.
    #[error("redemption declined")]
    FraudRejected {
        flags: Vec<FraudFlag>,
        case_id: Option<FraudCaseId>,
    },

    /// Voucher has redemptions and cannot be deleted
    #[error("voucher {0} has redemptions and cannot be deleted")]
    VoucherInUse(VoucherId),

    /// Code already assigned to another voucher
    #[error("duplicate code: {0}")]
    DuplicateCode(String),

    /// Concurrent modification detected by the store
    #[error("conflict on voucher {0}")]
    Conflict(VoucherId),

    /// Backing store did not answer in time; nothing was committed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RedemptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CodeNotFound
            | Self::VoucherNotFound(_)
            | Self::VoucherExpired(_)
            | Self::InvalidState { .. }
            | Self::InvalidTransition(_)
            | Self::VoucherInUse(_)
            | Self::DuplicateCode(_) => ErrorKind::Validation,
            Self::QuotaExceeded(_) | Self::Conflict(_) => ErrorKind::Contention,
            Self::FraudRejected { .. } => ErrorKind::Fraud,
            Self::Timeout(_)
            | Self::Database(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// True for store conflicts and transient database failures.
    ///
    /// Quota, fraud and validation failures are final for the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Database(err) => is_retryable_db_error(err),
            _ => false,
        }
    }

    /// Short stable label, used for metrics and the attempt log
    pub fn label(&self) -> &'static str {
        match self {
            Self::CodeNotFound => "code_not_found",
            Self::VoucherNotFound(_) => "voucher_not_found",
            Self::VoucherExpired(_) => "voucher_expired",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::FraudRejected { .. } => "fraud_rejected",
            Self::VoucherInUse(_) => "voucher_in_use",
            Self::DuplicateCode(_) => "duplicate_code",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Database(_) => "database",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for redemption operations
pub type Result<T> = std::result::Result<T, RedemptionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Severity, UserId};

    #[test]
    fn test_fraud_rejection_message_is_generic() {
        let err = RedemptionError::FraudRejected {
            flags: vec![FraudFlag::SharedDeviceAbuse {
                severity: Severity::High,
                fingerprint: "dev-1".into(),
                other_users: 4,
            }],
            case_id: None,
        };
        let msg = err.to_string();
        assert_eq!(msg, "redemption declined");
        assert!(!msg.contains("device"));
        assert_eq!(err.kind(), ErrorKind::Fraud);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        let id = VoucherId::new();
        assert_eq!(RedemptionError::CodeNotFound.kind(), ErrorKind::Validation);
        assert_eq!(
            RedemptionError::InvalidState {
                voucher_id: id,
                state: VoucherState::Redeemed
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            RedemptionError::from(QuotaError::GlobalLimitReached { voucher_id: id, max: 1 })
                .kind(),
            ErrorKind::Contention
        );
        assert_eq!(
            RedemptionError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            RedemptionError::Database(sqlx::Error::PoolTimedOut).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_retryable_only_for_conflicts_and_transient_db() {
        let id = VoucherId::new();
        assert!(RedemptionError::Conflict(id).is_retryable());
        assert!(RedemptionError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!RedemptionError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!RedemptionError::from(QuotaError::UserLimitReached {
            voucher_id: id,
            user_id: UserId::new(),
            max: 1
        })
        .is_retryable());
        assert!(!RedemptionError::VoucherExpired(id).is_retryable());
    }
}
