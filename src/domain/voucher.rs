//! Voucher aggregate: lifecycle state, redemption limits and codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{BusinessId, CategoryId, VoucherId};

/// Default per-user redemption limit
pub const DEFAULT_MAX_REDEMPTIONS_PER_USER: u32 = 1;

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle state of a voucher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoucherState {
    /// Created by an issuer, not yet discoverable
    #[default]
    New,
    /// Discoverable by customers
    Published,
    /// Reserved ahead of redemption
    Claimed,
    /// Consumed (terminal)
    Redeemed,
    /// Past its validity or withdrawn (terminal)
    Expired,
}

impl VoucherState {
    pub const ALL: [VoucherState; 5] = [
        VoucherState::New,
        VoucherState::Published,
        VoucherState::Claimed,
        VoucherState::Redeemed,
        VoucherState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Published => "published",
            Self::Claimed => "claimed",
            Self::Redeemed => "redeemed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Redeemed | Self::Expired)
    }
}

impl fmt::Display for VoucherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoucherState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "published" => Ok(Self::Published),
            "claimed" => Ok(Self::Claimed),
            "redeemed" => Ok(Self::Redeemed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown voucher state: {other}")),
        }
    }
}

// =============================================================================
// Codes
// =============================================================================

/// How a redemption code is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeType {
    Qr,
    Short,
    Static,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Short => "short",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qr" => Ok(Self::Qr),
            "short" => Ok(Self::Short),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown code type: {other}")),
        }
    }
}

/// A code that resolves to a voucher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCode {
    pub code: String,
    pub code_type: CodeType,
    pub is_active: bool,
}

impl VoucherCode {
    pub fn new(code: impl Into<String>, code_type: CodeType) -> Self {
        Self {
            code: code.into(),
            code_type,
            is_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

// =============================================================================
// Discount
// =============================================================================

/// Kind of discount a voucher grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount_value` is in basis points (1000 = 10%)
    #[default]
    Percentage,
    /// `discount_value` is in the currency's smallest unit
    FixedAmount,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::FixedAmount => "fixed_amount",
        }
    }
}

impl FromStr for DiscountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(Self::Percentage),
            "fixed_amount" => Ok(Self::FixedAmount),
            other => Err(format!("unknown discount type: {other}")),
        }
    }
}

// =============================================================================
// Voucher
// =============================================================================

/// A discount instrument with a bounded redemption quota.
///
/// Invariants:
/// - `current_redemptions <= max_redemptions` when a maximum is set
/// - `state` only changes through [`VoucherStateMachine`](super::VoucherStateMachine)
/// - a voucher with `current_redemptions > 0` is never deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: VoucherId,
    pub business_id: BusinessId,
    pub category_id: CategoryId,
    pub state: VoucherState,

    pub discount_type: DiscountType,
    pub discount_value: u64,
    pub currency: String,

    pub valid_from: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Global cap; `None` means unlimited
    pub max_redemptions: Option<u32>,
    pub max_redemptions_per_user: u32,
    pub current_redemptions: u32,

    pub codes: Vec<VoucherCode>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    /// Create a new voucher in the `New` state with default limits
    pub fn new(
        business_id: BusinessId,
        category_id: CategoryId,
        valid_from: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: VoucherId::new(),
            business_id,
            category_id,
            state: VoucherState::New,
            discount_type: DiscountType::default(),
            discount_value: 0,
            currency: "EUR".to_string(),
            valid_from,
            expires_at,
            max_redemptions: None,
            max_redemptions_per_user: DEFAULT_MAX_REDEMPTIONS_PER_USER,
            current_redemptions: 0,
            codes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_discount(
        mut self,
        discount_type: DiscountType,
        value: u64,
        currency: impl Into<String>,
    ) -> Self {
        self.discount_type = discount_type;
        self.discount_value = value;
        self.currency = currency.into();
        self
    }

    pub fn with_max_redemptions(mut self, max: u32) -> Self {
        self.max_redemptions = Some(max);
        self
    }

    pub fn with_max_redemptions_per_user(mut self, max: u32) -> Self {
        self.max_redemptions_per_user = max;
        self
    }

    pub fn with_code(mut self, code: VoucherCode) -> Self {
        self.codes.push(code);
        self
    }

    pub fn with_state(mut self, state: VoucherState) -> Self {
        self.state = state;
        self
    }

    /// Find a code by exact match, active or not
    pub fn find_code(&self, code: &str) -> Option<&VoucherCode> {
        self.codes.iter().find(|c| c.code == code)
    }

    /// True once the global cap has been consumed
    pub fn is_exhausted(&self) -> bool {
        self.max_redemptions
            .map(|max| self.current_redemptions >= max)
            .unwrap_or(false)
    }

    /// Remaining global redemptions (`None` = unlimited)
    pub fn remaining_redemptions(&self) -> Option<u32> {
        self.max_redemptions
            .map(|max| max.saturating_sub(self.current_redemptions))
    }

    /// `valid_from <= now <= expires_at`
    pub fn is_within_validity(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.expires_at
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A voucher together with the code that resolved it
#[derive(Debug, Clone, PartialEq)]
pub struct CodeMatch {
    pub voucher: Voucher,
    pub code: VoucherCode,
}
