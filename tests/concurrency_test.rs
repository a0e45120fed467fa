//! Concurrent redemptions racing for the same quota.

mod common;

use std::sync::Arc;

use common::{claimed_voucher, Harness};
use voucher_redemption::domain::{RedemptionContext, UserId, VoucherState};
use voucher_redemption::infra::{RedemptionError, VoucherRepository};
use voucher_redemption::redemption::RedemptionCoordinator;

/// Fire one redemption per user concurrently and split the results
async fn race(
    coordinator: Arc<RedemptionCoordinator>,
    code: &'static str,
    users: usize,
) -> (usize, usize, Vec<String>) {
    let handles: Vec<_> = (0..users)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .redeem(code, &UserId::new(), &RedemptionContext::new())
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    let mut quota_exceeded = 0;
    let mut other = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(RedemptionError::QuotaExceeded(_)) => quota_exceeded += 1,
            Err(e) => other.push(e.to_string()),
        }
    }
    (accepted, quota_exceeded, other)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_users_ten_slots() {
    let h = Harness::new();
    let v = claimed_voucher("RUSH", 10);
    h.insert(&v).await;
    let store = h.store.clone();
    let coordinator = Arc::new(h.coordinator);

    let (accepted, quota_exceeded, other) = race(coordinator, "RUSH", 50).await;

    assert_eq!(accepted, 10);
    assert_eq!(quota_exceeded, 40);
    assert!(other.is_empty(), "unexpected errors: {other:?}");

    let stored = store.get(&v.id).await.unwrap().unwrap();
    assert_eq!(stored.current_redemptions, 10);
    assert_eq!(stored.state, VoucherState::Redeemed);
    assert_eq!(store.redemptions_for(&v.id).await.unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_users_single_slot() {
    let h = Harness::new();
    let v = claimed_voucher("ABC123", 1);
    h.insert(&v).await;
    let store = h.store.clone();
    let coordinator = Arc::new(h.coordinator);

    let (accepted, quota_exceeded, other) = race(coordinator, "ABC123", 2).await;

    assert_eq!((accepted, quota_exceeded), (1, 1));
    assert!(other.is_empty(), "unexpected errors: {other:?}");
    assert_eq!(
        store.get(&v.id).await.unwrap().unwrap().state,
        VoucherState::Redeemed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_distinct_vouchers_do_not_interfere() {
    const CODES: [&str; 4] = ["IND-A", "IND-B", "IND-C", "IND-D"];

    let h = Harness::new();
    let mut ids = Vec::new();
    for code in CODES {
        let v = claimed_voucher(code, 5);
        ids.push(v.id);
        h.insert(&v).await;
    }
    let store = h.store.clone();
    let coordinator = Arc::new(h.coordinator);

    let races: Vec<_> = CODES
        .into_iter()
        .map(|code| tokio::spawn(race(coordinator.clone(), code, 5)))
        .collect();

    for handle in races {
        let (accepted, quota_exceeded, other) = handle.await.unwrap();
        assert_eq!(accepted, 5);
        assert_eq!(quota_exceeded, 0);
        assert!(other.is_empty(), "unexpected errors: {other:?}");
    }

    for id in ids {
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().current_redemptions,
            5
        );
    }
}
