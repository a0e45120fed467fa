//! Performance benchmarks for the redemption core.
//!
//! Run with: cargo bench

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use voucher_redemption::domain::{
    AttemptOutcome, AttemptSummary, BusinessId, CategoryId, CodeType, GeoPoint,
    RedemptionContext, UserId, Voucher, VoucherCode, VoucherId, VoucherState,
};
use voucher_redemption::infra::{InMemoryRedemptionStore, ManualClock, RetryConfig, VoucherRepository};
use voucher_redemption::redemption::{
    FraudScoringEngine, HistorySnapshot, RedemptionCoordinator, ScoringInput,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn voucher(code: &str, max: u32) -> Voucher {
    Voucher::new(
        BusinessId::new(),
        CategoryId::new(),
        now() - Duration::days(1),
        now() + Duration::days(1),
    )
    .with_state(VoucherState::Claimed)
    .with_max_redemptions(max)
    .with_code(VoucherCode::new(code, CodeType::Short))
}

/// History of `count` located attempts spread over the last day
fn history(user: UserId, count: usize) -> HistorySnapshot {
    let by_user = (0..count)
        .map(|i| AttemptSummary {
            voucher_id: VoucherId::new(),
            user_id: user,
            attempted_at: now() - Duration::minutes((count - i) as i64 * 7),
            location: Some(GeoPoint::new(52.0 + i as f64 * 0.01, 13.0)),
            device_fingerprint: Some(format!("dev-{}", i % 4)),
            outcome: AttemptOutcome::Accepted,
        })
        .collect::<Vec<_>>();
    HistorySnapshot {
        by_device: by_user.clone(),
        by_user,
    }
}

/// Benchmark pure fraud scoring over growing histories
fn bench_fraud_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("fraud_scoring");
    let engine = FraudScoringEngine::default();
    let v = voucher("BENCH", 10);
    let user = UserId::new();
    let ctx = RedemptionContext::new()
        .with_location(GeoPoint::new(48.85, 2.35))
        .with_device("dev-1");

    for count in [0usize, 10, 100, 1000] {
        let snapshot = history(user, count);
        group.throughput(Throughput::Elements(count.max(1) as u64));
        group.bench_with_input(BenchmarkId::new("score", count), &snapshot, |b, snapshot| {
            let input = ScoringInput {
                voucher: &v,
                user_id: &user,
                code: &v.codes[0],
                context: &ctx,
            };
            b.iter(|| black_box(engine.score(&input, snapshot, now())));
        });
    }

    group.finish();
}

/// Benchmark end-to-end redemption against the in-memory store
fn bench_in_memory_redeem(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryRedemptionStore::new());
    let v = Voucher {
        max_redemptions: None,
        ..voucher("UNLIMITED", 1)
    }
    .with_max_redemptions_per_user(u32::MAX);
    runtime.block_on(store.insert(&v)).unwrap();

    let coordinator = RedemptionCoordinator::from_store(store)
        .with_clock(Arc::new(ManualClock::new(now())))
        .with_retry(RetryConfig::fast());
    let ctx = RedemptionContext::new();

    c.bench_function("redeem_in_memory", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                coordinator
                    .redeem("UNLIMITED", &UserId::new(), &ctx)
                    .await
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, bench_fraud_scoring, bench_in_memory_redeem);
criterion_main!(benches);
