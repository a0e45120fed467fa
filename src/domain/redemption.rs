//! Redemption attempts, records and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    BusinessId, CodeType, FraudCaseId, FraudFlag, GeoPoint, RedemptionId, UserId, VoucherId,
    VoucherState,
};

/// Caller-supplied context for a redemption attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedemptionContext {
    pub location: Option<GeoPoint>,
    pub device_info: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub business_id: Option<BusinessId>,
    pub ip_address: Option<String>,
    /// Code type accepted by the path the code was scanned through
    pub expected_code_type: Option<CodeType>,
}

impl RedemptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_device(mut self, device_info: impl Into<String>) -> Self {
        self.device_info = Some(device_info.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_business(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self
    }

    pub fn expecting(mut self, code_type: CodeType) -> Self {
        self.expected_code_type = Some(code_type);
        self
    }

    /// Device identity used for cross-user reuse checks.
    ///
    /// Falls back to the session id when no device info is supplied; blank
    /// values are ignored.
    pub fn device_fingerprint(&self) -> Option<&str> {
        self.device_info
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.session_id.as_deref().filter(|s| !s.trim().is_empty()))
    }
}

/// Result of a single attempt, as kept in the attempt log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Rejected { reason: String },
    Flagged { risk_score: u8, flags: Vec<FraudFlag> },
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Flagged { .. } => "flagged",
        }
    }
}

/// Past attempt as seen by the fraud engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub attempted_at: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub device_fingerprint: Option<String>,
    pub outcome: AttemptOutcome,
}

impl AttemptSummary {
    pub fn new(
        voucher_id: VoucherId,
        user_id: UserId,
        attempted_at: DateTime<Utc>,
        context: &RedemptionContext,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            voucher_id,
            user_id,
            attempted_at,
            location: context.location,
            device_fingerprint: context.device_fingerprint().map(str::to_owned),
            outcome,
        }
    }
}

/// Persisted proof of a successful redemption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub id: RedemptionId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
    pub code: String,
    pub redeemed_at: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub risk_score: u8,
    /// Flags in the order the engine raised them
    pub flags: Vec<FraudFlag>,
}

/// Returned to the caller of `redeem`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionOutcome {
    pub voucher_id: VoucherId,
    pub state: VoucherState,
    pub record_id: RedemptionId,
    pub current_redemptions: u32,
    pub remaining_redemptions: Option<u32>,
    pub risk_score: u8,
    /// Set when the attempt was accepted but queued for review
    pub review_case_id: Option<FraudCaseId>,
}
