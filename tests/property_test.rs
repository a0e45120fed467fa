//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for any valid input.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use voucher_redemption::domain::{
    AttemptOutcome, AttemptSummary, BusinessId, CategoryId, CodeType, FraudDecision, GeoPoint,
    RedemptionContext, TransitionError, UserId, Voucher, VoucherCode, VoucherId, VoucherState,
    VoucherStateMachine, MAX_RISK_SCORE,
};
use voucher_redemption::redemption::{
    FraudScoringEngine, HistorySnapshot, QuotaError, RedemptionQuotaTracker, ScoringInput,
};

// ============================================================================
// Custom Strategies
// ============================================================================

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn arb_state() -> impl Strategy<Value = VoucherState> {
    prop::sample::select(VoucherState::ALL.to_vec())
}

fn arb_code_type() -> impl Strategy<Value = CodeType> {
    prop_oneof![
        Just(CodeType::Qr),
        Just(CodeType::Short),
        Just(CodeType::Static),
    ]
}

fn arb_point() -> impl Strategy<Value = GeoPoint> {
    (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lon)| GeoPoint::new(lat, lon))
}

/// Users drawn from a small pool so device sharing actually happens
fn arb_attempt(users: Vec<UserId>) -> impl Strategy<Value = AttemptSummary> {
    (
        prop::sample::select(users),
        0i64..2 * 24 * 60,
        prop::option::of(arb_point()),
        prop::option::of(prop::sample::select(vec!["dev-a", "dev-b", "dev-c"])),
    )
        .prop_map(|(user_id, minutes_ago, location, device)| AttemptSummary {
            voucher_id: VoucherId::new(),
            user_id,
            attempted_at: now() - Duration::minutes(minutes_ago),
            location,
            device_fingerprint: device.map(str::to_string),
            outcome: AttemptOutcome::Accepted,
        })
}

fn arb_scenario() -> impl Strategy<
    Value = (
        UserId,
        Vec<AttemptSummary>,
        Option<GeoPoint>,
        Option<&'static str>,
        CodeType,
        Option<CodeType>,
        bool,
    ),
> {
    let user = UserId::new();
    let pool = vec![user, UserId::new(), UserId::new(), UserId::new()];
    (
        Just(user),
        prop::collection::vec(arb_attempt(pool), 0..30),
        prop::option::of(arb_point()),
        prop::option::of(prop::sample::select(vec!["dev-a", "dev-b", "dev-c"])),
        arb_code_type(),
        prop::option::of(arb_code_type()),
        any::<bool>(),
    )
}

fn voucher(code: VoucherCode) -> Voucher {
    Voucher::new(
        BusinessId::new(),
        CategoryId::new(),
        now() - Duration::days(1),
        now() + Duration::days(1),
    )
    .with_state(VoucherState::Claimed)
    .with_code(code)
}

const LEGAL: [(VoucherState, VoucherState); 7] = [
    (VoucherState::New, VoucherState::Published),
    (VoucherState::New, VoucherState::Expired),
    (VoucherState::Published, VoucherState::Claimed),
    (VoucherState::Published, VoucherState::Expired),
    (VoucherState::Claimed, VoucherState::Redeemed),
    (VoucherState::Claimed, VoucherState::Expired),
    (VoucherState::Expired, VoucherState::Expired),
];

// ============================================================================
// State Machine Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_transition_matches_table(from in arb_state(), to in arb_state()) {
        let legal = LEGAL.contains(&(from, to));
        prop_assert_eq!(VoucherStateMachine::can_transition(from, to), legal);

        match VoucherStateMachine::transition(from, to) {
            Ok(next) => {
                prop_assert!(legal);
                prop_assert_eq!(next, to);
            }
            Err(TransitionError::InvalidTransition { from: f, to: t }) => {
                prop_assert!(!legal);
                prop_assert_eq!((f, t), (from, to));
            }
        }
    }

    #[test]
    fn prop_terminal_states_only_self_loop(from in arb_state(), to in arb_state()) {
        if from.is_terminal() && VoucherStateMachine::can_transition(from, to) {
            prop_assert_eq!((from, to), (VoucherState::Expired, VoucherState::Expired));
        }
        if !from.is_terminal() {
            prop_assert!(VoucherStateMachine::can_transition(from, VoucherState::Expired));
        }
    }

    #[test]
    fn prop_redemption_only_from_claimed_or_direct(state in arb_state(), direct in any::<bool>()) {
        let permitted = VoucherStateMachine::permits_redemption(state, direct);
        let expected = state == VoucherState::Claimed
            || (direct && state == VoucherState::Published);
        prop_assert_eq!(permitted, expected);
        prop_assert_eq!(
            VoucherStateMachine::redemption_path(state, direct).is_ok(),
            permitted
        );
    }
}

// ============================================================================
// Quota Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_reservation_never_exceeds_caps(
        max in 1u32..50,
        used in 0u32..60,
        per_user in 1u32..5,
        prior in 0u32..6,
    ) {
        let mut v = voucher(VoucherCode::new("Q", CodeType::Short))
            .with_max_redemptions(max)
            .with_max_redemptions_per_user(per_user);
        v.current_redemptions = used.min(max);
        let user = UserId::new();

        match RedemptionQuotaTracker::new().reserve(&v, &user, prior) {
            Ok(token) => {
                prop_assert!(token.slot <= max);
                prop_assert_eq!(token.slot, v.current_redemptions + 1);
                prop_assert!(token.user_slot <= per_user);
                prop_assert_eq!(token.remaining, Some(max - token.slot));
            }
            Err(QuotaError::GlobalLimitReached { .. }) => {
                prop_assert_eq!(v.current_redemptions, max);
            }
            Err(QuotaError::UserLimitReached { .. }) => {
                prop_assert!(v.current_redemptions < max);
                prop_assert!(prior >= per_user);
            }
        }
    }

    #[test]
    fn prop_sequential_reservations_stop_at_max(max in 1u32..30, users in 1usize..60) {
        let mut v = voucher(VoucherCode::new("Q", CodeType::Short)).with_max_redemptions(max);
        let tracker = RedemptionQuotaTracker::new();
        let mut granted = 0u32;

        for _ in 0..users {
            if let Ok(token) = tracker.reserve(&v, &UserId::new(), 0) {
                v.current_redemptions = token.slot;
                granted += 1;
            }
        }

        prop_assert_eq!(granted, max.min(users as u32));
        prop_assert!(v.current_redemptions <= max);
    }
}

// ============================================================================
// Fraud Scoring Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_scoring_is_deterministic_and_bounded(
        (user, attempts, location, device, code_type, expected, active) in arb_scenario()
    ) {
        let mut code = VoucherCode::new("CODE", code_type);
        if !active {
            code = code.inactive();
        }
        let v = voucher(code.clone());

        let mut ctx = RedemptionContext::new();
        ctx.location = location;
        ctx.device_info = device.map(str::to_string);
        ctx.expected_code_type = expected;

        let history = HistorySnapshot {
            by_user: attempts.iter().filter(|a| a.user_id == user).cloned().collect(),
            by_device: attempts
                .iter()
                .filter(|a| a.device_fingerprint.is_some()
                    && a.device_fingerprint.as_deref() == ctx.device_fingerprint())
                .cloned()
                .collect(),
        };

        let engine = FraudScoringEngine::default();
        let input = ScoringInput { voucher: &v, user_id: &user, code: &code, context: &ctx };

        let first = engine.score(&input, &history, now());
        let second = engine.score(&input, &history, now());
        prop_assert_eq!(&first, &second);

        prop_assert!(first.score <= MAX_RISK_SCORE);
        prop_assert_eq!(first.score, FraudScoringEngine::aggregate(&first.flags));
        prop_assert_eq!(first.decision, engine.decide(first.score, &first.flags));

        if first.flags.iter().any(|f| f.is_code_misuse()) {
            prop_assert_eq!(first.decision, FraudDecision::Reject);
        }
        if first.flags.is_empty() {
            prop_assert_eq!(first.score, 0);
            prop_assert_eq!(first.decision, FraudDecision::Accept);
        }
    }

    #[test]
    fn prop_distance_is_symmetric(a in arb_point(), b in arb_point()) {
        let ab = a.distance_km(&b);
        let ba = b.distance_km(&a);
        prop_assert!(ab >= 0.0);
        prop_assert!((ab - ba).abs() < 1e-6);
        prop_assert!(ab <= std::f64::consts::PI * 6371.0 + 1e-6);
    }
}
