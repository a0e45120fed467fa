//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use voucher_redemption::domain::{
    BusinessId, CategoryId, CodeType, GeoPoint, Voucher, VoucherCode, VoucherState,
};
use voucher_redemption::infra::{InMemoryRedemptionStore, ManualClock, RetryConfig};
use voucher_redemption::redemption::{RedemptionCoordinator, RedemptionPolicy};

pub const BERLIN: GeoPoint = GeoPoint {
    latitude: 52.52,
    longitude: 13.405,
};

pub const ROME: GeoPoint = GeoPoint {
    latitude: 41.9028,
    longitude: 12.4964,
};

/// Fixed "now" for deterministic scenarios
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// A voucher valid for a week around [`test_now`], with one SHORT code
pub fn claimed_voucher(code: &str, max_redemptions: u32) -> Voucher {
    voucher_with_code(VoucherCode::new(code, CodeType::Short))
        .with_state(VoucherState::Claimed)
        .with_max_redemptions(max_redemptions)
}

pub fn voucher_with_code(code: VoucherCode) -> Voucher {
    Voucher::new(
        BusinessId::new(),
        CategoryId::new(),
        test_now() - Duration::days(7),
        test_now() + Duration::days(7),
    )
    .with_code(code)
}

/// Store, manual clock and coordinator wired together
pub struct Harness {
    pub store: Arc<InMemoryRedemptionStore>,
    pub clock: Arc<ManualClock>,
    pub coordinator: RedemptionCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RedemptionPolicy::default())
    }

    pub fn with_policy(policy: RedemptionPolicy) -> Self {
        let store = Arc::new(InMemoryRedemptionStore::new());
        let clock = Arc::new(ManualClock::new(test_now()));
        let coordinator = RedemptionCoordinator::from_store(store.clone())
            .with_clock(clock.clone())
            .with_policy(policy)
            .with_retry(RetryConfig::fast());
        Self {
            store,
            clock,
            coordinator,
        }
    }

    pub async fn insert(&self, voucher: &Voucher) {
        use voucher_redemption::infra::VoucherRepository;
        self.store.insert(voucher).await.unwrap();
    }
}
