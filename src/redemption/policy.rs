//! Redemption policy flags.
//!
//! # Configuration
//!
//! - `REDEMPTION_ALLOW_DIRECT` - Redeem PUBLISHED vouchers without a prior claim (default: false)
//! - `REDEMPTION_MULTI_USE` - Keep multi-slot vouchers CLAIMED until the quota is used up (default: true)
//! - `REDEMPTION_COMMIT_TIMEOUT_MS` - Upper bound on the atomic commit, retries included (default: 5000)

use std::time::Duration;

/// How redemptions move a voucher through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionPolicy {
    /// PUBLISHED vouchers may be redeemed without a prior claim
    pub allow_direct: bool,
    /// A voucher with slots left stays CLAIMED after a redemption.
    /// When false, the first redemption moves it to REDEEMED.
    pub multi_use: bool,
    pub commit_timeout: Duration,
}

impl Default for RedemptionPolicy {
    fn default() -> Self {
        Self {
            allow_direct: false,
            multi_use: true,
            commit_timeout: Duration::from_secs(5),
        }
    }
}

impl RedemptionPolicy {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup, falling back to defaults for missing
    /// or unparseable values
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let allow_direct = var("REDEMPTION_ALLOW_DIRECT")
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.allow_direct);

        let multi_use = var("REDEMPTION_MULTI_USE")
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.multi_use);

        let commit_timeout = var("REDEMPTION_COMMIT_TIMEOUT_MS")
            .and_then(|v| v.trim().parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.commit_timeout);

        Self {
            allow_direct,
            multi_use,
            commit_timeout,
        }
    }

    pub fn with_direct_redemption(mut self, allow: bool) -> Self {
        self.allow_direct = allow;
        self
    }

    pub fn with_multi_use(mut self, multi_use: bool) -> Self {
        self.multi_use = multi_use;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }
}

/// Parse a boolean environment value; `None` for anything unrecognised
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
