//! Redemption coordinator
//!
//! Runs one redemption end to end:
//!
//! 1. Resolve the voucher by exact code match
//! 2. Check the validity window (overdue vouchers are flipped to EXPIRED)
//! 3. Check the state permits redemption
//! 4. Score the attempt; a reject opens a fraud case and stops here
//! 5. Reserve a quota slot and commit, inside the store's critical section
//!
//! Steps 2, 3 and 5 are re-checked by the commit mutation against the
//! locked voucher, so the early checks only save work; they never decide a
//! race. Nothing in steps 1-4 writes to the voucher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::{
    AttemptOutcome, AttemptSummary, CodeMatch, FraudAssessment, FraudCase, FraudDecision,
    RedemptionContext, RedemptionId, RedemptionOutcome, RedemptionRecord, TransitionError, UserId,
    Voucher, VoucherCode, VoucherId, VoucherState, VoucherStateMachine,
};
use crate::infra::{
    Clock, CommitMutation, CommitPlan, CommitReceipt, FraudCaseSink, FraudHistory,
    RedemptionError, Result, Retry, RetryConfig, SystemClock, VoucherRepository,
};
use crate::metrics::{metric_names, timed, MetricsRegistry, RISK_SCORE_BUCKETS};

use super::{
    FraudConfig, FraudScoringEngine, QuotaError, RedemptionPolicy, RedemptionQuotaTracker,
    ScoringInput,
};

// =============================================================================
// Commit mutation
// =============================================================================

/// Writes of one accepted redemption, planned against the locked voucher.
///
/// Ids and timestamps are fixed up front so a retried commit plans the same
/// writes.
struct RedemptionCommit<'a> {
    quota: RedemptionQuotaTracker,
    policy: &'a RedemptionPolicy,
    user_id: UserId,
    code: &'a str,
    context: &'a RedemptionContext,
    assessment: &'a FraudAssessment,
    record_id: RedemptionId,
    review_case: Option<FraudCase>,
    now: DateTime<Utc>,
}

impl CommitMutation for RedemptionCommit<'_> {
    fn plan(&self, voucher: &Voucher, prior_user_redemptions: u32) -> Result<CommitPlan> {
        check_redeemable(voucher, prior_user_redemptions, self.policy.allow_direct)?;
        if !voucher.is_within_validity(self.now) {
            return Err(RedemptionError::VoucherExpired(voucher.id));
        }

        let token = self
            .quota
            .reserve(voucher, &self.user_id, prior_user_redemptions)?;
        let path = VoucherStateMachine::redemption_path(voucher.state, self.policy.allow_direct)?;

        let next_state = if token.exhausts_quota() || !self.policy.multi_use {
            path.last().copied().unwrap_or(VoucherState::Redeemed)
        } else {
            VoucherState::Claimed
        };

        let outcome = match self.assessment.decision {
            FraudDecision::Accept => AttemptOutcome::Accepted,
            _ => AttemptOutcome::Flagged {
                risk_score: self.assessment.score,
                flags: self.assessment.flags.clone(),
            },
        };

        Ok(CommitPlan {
            next_state,
            next_redemptions: token.slot,
            record: RedemptionRecord {
                id: self.record_id,
                voucher_id: voucher.id,
                user_id: self.user_id,
                code: self.code.to_owned(),
                redeemed_at: self.now,
                location: self.context.location,
                risk_score: self.assessment.score,
                flags: self.assessment.flags.clone(),
            },
            attempt: AttemptSummary::new(voucher.id, self.user_id, self.now, self.context, outcome),
            review_case: self.review_case.clone(),
        })
    }
}

/// State gate shared by the pre-check and the locked re-check.
///
/// A voucher that went REDEEMED because its quota ran out reports
/// `QuotaExceeded` to users who never redeemed it, and `InvalidState` to a
/// user retrying after their own success.
fn check_redeemable(voucher: &Voucher, prior_user_redemptions: u32, allow_direct: bool) -> Result<()> {
    if VoucherStateMachine::permits_redemption(voucher.state, allow_direct) {
        return Ok(());
    }

    match voucher.max_redemptions {
        Some(max)
            if voucher.state == VoucherState::Redeemed
                && voucher.is_exhausted()
                && prior_user_redemptions == 0 =>
        {
            Err(QuotaError::GlobalLimitReached {
                voucher_id: voucher.id,
                max,
            }
            .into())
        }
        _ => Err(RedemptionError::InvalidState {
            voucher_id: voucher.id,
            state: voucher.state,
        }),
    }
}

/// Errors that count as a rejected attempt in the attempt log
fn is_business_rejection(err: &RedemptionError) -> bool {
    matches!(
        err,
        RedemptionError::VoucherExpired(_)
            | RedemptionError::InvalidState { .. }
            | RedemptionError::QuotaExceeded(_)
    )
}

// =============================================================================
// Coordinator
// =============================================================================

/// Orchestrates redemptions and administrative state changes
pub struct RedemptionCoordinator {
    repository: Arc<dyn VoucherRepository>,
    history: Arc<dyn FraudHistory>,
    cases: Arc<dyn FraudCaseSink>,
    clock: Arc<dyn Clock>,
    engine: FraudScoringEngine,
    quota: RedemptionQuotaTracker,
    policy: RedemptionPolicy,
    retry: Retry,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RedemptionCoordinator {
    pub fn new(
        repository: Arc<dyn VoucherRepository>,
        history: Arc<dyn FraudHistory>,
        cases: Arc<dyn FraudCaseSink>,
    ) -> Self {
        Self {
            repository,
            history,
            cases,
            clock: Arc::new(SystemClock),
            engine: FraudScoringEngine::default(),
            quota: RedemptionQuotaTracker::new(),
            policy: RedemptionPolicy::default(),
            retry: Retry::new(RetryConfig::database()),
            metrics: None,
        }
    }

    /// Build from a single store that backs all three ports
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: VoucherRepository + FraudHistory + FraudCaseSink + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RedemptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fraud_config(mut self, config: FraudConfig) -> Self {
        self.engine = FraudScoringEngine::new(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Retry::new(config);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RedemptionPolicy {
        &self.policy
    }

    pub fn engine(&self) -> &FraudScoringEngine {
        &self.engine
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.retry.config()
    }

    /// Redeem `code` for `user_id`.
    ///
    /// On success the redemption record, the attempt log entry and any
    /// review case were committed together. On failure nothing on the
    /// voucher changed, except an overdue voucher being flipped to EXPIRED.
    #[tracing::instrument(skip(self, user_id, context), fields(user_id = %user_id))]
    pub async fn redeem(
        &self,
        code: &str,
        user_id: &UserId,
        context: &RedemptionContext,
    ) -> Result<RedemptionOutcome> {
        let result = match &self.metrics {
            Some(metrics) => {
                timed(
                    metrics,
                    metric_names::REDEMPTION_LATENCY,
                    self.redeem_inner(code, user_id, context),
                )
                .await
            }
            None => self.redeem_inner(code, user_id, context).await,
        };

        match &result {
            Ok(outcome) => {
                info!(
                    voucher_id = %outcome.voucher_id,
                    state = %outcome.state,
                    redemptions = outcome.current_redemptions,
                    risk_score = outcome.risk_score,
                    "voucher redeemed"
                );
                self.inc(metric_names::REDEMPTIONS_ACCEPTED).await;
            }
            Err(e) => {
                debug!(error = %e, kind = e.kind().as_str(), "redemption failed");
                self.inc(&format!(
                    "{}.{}",
                    metric_names::REDEMPTIONS_REJECTED_PREFIX,
                    e.label()
                ))
                .await;
            }
        }

        result
    }

    async fn redeem_inner(
        &self,
        code: &str,
        user_id: &UserId,
        context: &RedemptionContext,
    ) -> Result<RedemptionOutcome> {
        let now = self.clock.now();

        let CodeMatch {
            voucher,
            code: matched,
        } = self
            .repository
            .find_by_code(code)
            .await?
            .ok_or(RedemptionError::CodeNotFound)?;

        if let Err(e) = self.precheck(&voucher, user_id, now).await {
            self.log_rejection(&voucher.id, user_id, now, context, &e).await;
            return Err(e);
        }

        let assessment = self
            .engine
            .evaluate(
                self.history.as_ref(),
                ScoringInput {
                    voucher: &voucher,
                    user_id,
                    code: &matched,
                    context,
                },
                now,
            )
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .observe_with_buckets(
                    metric_names::FRAUD_RISK_SCORE,
                    RISK_SCORE_BUCKETS,
                    f64::from(assessment.score),
                )
                .await;
        }

        if assessment.decision == FraudDecision::Reject {
            return Err(self
                .decline(&voucher, user_id, &matched, context, &assessment, now)
                .await);
        }

        let review_case = (assessment.decision == FraudDecision::Review).then(|| {
            FraudCase::open(
                voucher.id,
                *user_id,
                context.business_id.unwrap_or(voucher.business_id),
                matched.code.clone(),
                &assessment,
                context.clone(),
                now,
            )
        });

        let mutation = RedemptionCommit {
            quota: self.quota,
            policy: &self.policy,
            user_id: *user_id,
            code: &matched.code,
            context,
            assessment: &assessment,
            record_id: RedemptionId::new(),
            review_case,
            now,
        };

        let receipt = match self.commit(&voucher.id, user_id, &mutation).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.log_rejection(&voucher.id, user_id, now, context, &e).await;
                return Err(e);
            }
        };

        if let Some(case_id) = receipt.review_case_id {
            warn!(
                voucher_id = %voucher.id,
                case_id = %case_id,
                risk_score = assessment.score,
                flags = ?assessment.flag_kinds(),
                "redemption accepted for review"
            );
            self.inc(metric_names::FRAUD_CASES_OPENED).await;
        }

        Ok(RedemptionOutcome {
            voucher_id: receipt.voucher.id,
            state: receipt.voucher.state,
            record_id: receipt.record_id,
            current_redemptions: receipt.voucher.current_redemptions,
            remaining_redemptions: receipt.voucher.remaining_redemptions(),
            risk_score: assessment.score,
            review_case_id: receipt.review_case_id,
        })
    }

    /// Validity and state checks against the unlocked snapshot
    async fn precheck(&self, voucher: &Voucher, user_id: &UserId, now: DateTime<Utc>) -> Result<()> {
        if !voucher.is_within_validity(now) {
            if voucher.is_past_expiry(now) {
                self.expire_overdue(voucher, now).await;
            }
            return Err(RedemptionError::VoucherExpired(voucher.id));
        }

        let prior = self
            .repository
            .user_redemption_count(&voucher.id, user_id)
            .await?;
        check_redeemable(voucher, prior, self.policy.allow_direct)
    }

    /// Best-effort flip of an overdue voucher to EXPIRED
    async fn expire_overdue(&self, voucher: &Voucher, now: DateTime<Utc>) {
        let Ok(next) = VoucherStateMachine::transition(voucher.state, VoucherState::Expired) else {
            return;
        };
        if next == voucher.state {
            return;
        }

        match self
            .repository
            .compare_and_set_state(&voucher.id, voucher.state, next, now)
            .await
        {
            Ok(_) => {
                info!(voucher_id = %voucher.id, from = %voucher.state, "overdue voucher expired");
                self.inc(metric_names::VOUCHERS_EXPIRED).await;
            }
            Err(e) => debug!(voucher_id = %voucher.id, error = %e, "could not expire voucher"),
        }
    }

    /// Open a fraud case for a rejected attempt and build the decline
    async fn decline(
        &self,
        voucher: &Voucher,
        user_id: &UserId,
        code: &VoucherCode,
        context: &RedemptionContext,
        assessment: &FraudAssessment,
        now: DateTime<Utc>,
    ) -> RedemptionError {
        let case = FraudCase::open(
            voucher.id,
            *user_id,
            context.business_id.unwrap_or(voucher.business_id),
            code.code.clone(),
            assessment,
            context.clone(),
            now,
        );

        let case_id = match self.cases.create(&case).await {
            Ok(id) => {
                self.inc(metric_names::FRAUD_CASES_OPENED).await;
                Some(id)
            }
            Err(e) => {
                error!(voucher_id = %voucher.id, error = %e, "failed to open fraud case");
                None
            }
        };

        let attempt = AttemptSummary::new(
            voucher.id,
            *user_id,
            now,
            context,
            AttemptOutcome::Flagged {
                risk_score: assessment.score,
                flags: assessment.flags.clone(),
            },
        );
        if let Err(e) = self.history.record_attempt(&attempt).await {
            warn!(voucher_id = %voucher.id, error = %e, "failed to log declined attempt");
        }

        warn!(
            voucher_id = %voucher.id,
            user_id = %user_id,
            risk_score = assessment.score,
            flags = ?assessment.flag_kinds(),
            case_id = ?case_id,
            "redemption declined by fraud scoring"
        );

        RedemptionError::FraudRejected {
            flags: assessment.flags.clone(),
            case_id,
        }
    }

    /// Atomic commit with bounded retries on conflicts, under the commit timeout
    async fn commit(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
        mutation: &RedemptionCommit<'_>,
    ) -> Result<CommitReceipt> {
        let mutation: &dyn CommitMutation = mutation;
        let timeout = self.policy.commit_timeout;

        let attempt = self.retry.run_with_predicate(
            || {
                self.repository
                    .atomic_reserve_and_commit(voucher_id, user_id, mutation)
            },
            |e: &RedemptionError| e.is_retryable(),
        );

        let outcome = tokio::time::timeout(timeout, attempt).await.map_err(|_| {
            warn!(voucher_id = %voucher_id, timeout_ms = timeout.as_millis() as u64, "commit timed out");
            RedemptionError::Timeout(timeout)
        })?;

        if outcome.attempts > 1 {
            if let Some(metrics) = &self.metrics {
                metrics
                    .add_counter(metric_names::COMMIT_RETRIES, u64::from(outcome.attempts - 1))
                    .await;
            }
        }

        outcome.result
    }

    async fn log_rejection(
        &self,
        voucher_id: &VoucherId,
        user_id: &UserId,
        now: DateTime<Utc>,
        context: &RedemptionContext,
        err: &RedemptionError,
    ) {
        if !is_business_rejection(err) {
            return;
        }

        let attempt = AttemptSummary::new(
            *voucher_id,
            *user_id,
            now,
            context,
            AttemptOutcome::Rejected {
                reason: err.label().to_string(),
            },
        );
        if let Err(e) = self.history.record_attempt(&attempt).await {
            warn!(voucher_id = %voucher_id, error = %e, "failed to log rejected attempt");
        }
    }

    async fn inc(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Whether `voucher` may move to `target`
    pub fn can_transition(&self, voucher: &Voucher, target: VoucherState) -> bool {
        VoucherStateMachine::can_transition(voucher.state, target)
    }

    /// Apply an administrative state change (publish, claim, expire).
    ///
    /// REDEEMED is only reachable through [`RedemptionCoordinator::redeem`],
    /// which also writes the counter and the record.
    #[tracing::instrument(skip(self))]
    pub async fn transition(&self, voucher_id: &VoucherId, target: VoucherState) -> Result<Voucher> {
        let voucher = self
            .repository
            .get(voucher_id)
            .await?
            .ok_or(RedemptionError::VoucherNotFound(*voucher_id))?;

        if target == VoucherState::Redeemed {
            return Err(TransitionError::InvalidTransition {
                from: voucher.state,
                to: target,
            }
            .into());
        }

        let next = VoucherStateMachine::transition(voucher.state, target)?;
        let updated = self
            .repository
            .compare_and_set_state(voucher_id, voucher.state, next, self.clock.now())
            .await?;

        info!(voucher_id = %voucher_id, from = %voucher.state, to = %next, "voucher transitioned");
        Ok(updated)
    }

    /// PUBLISHED -> CLAIMED on behalf of `user_id`
    pub async fn claim(&self, voucher_id: &VoucherId, user_id: &UserId) -> Result<Voucher> {
        let voucher = self.transition(voucher_id, VoucherState::Claimed).await?;
        debug!(voucher_id = %voucher_id, user_id = %user_id, "voucher claimed");
        Ok(voucher)
    }

    /// Delete a voucher that has never been redeemed
    pub async fn delete_voucher(&self, voucher_id: &VoucherId) -> Result<()> {
        self.repository.delete(voucher_id).await?;
        info!(voucher_id = %voucher_id, "voucher deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BusinessId, CategoryId, CodeType, FraudCaseId, RedemptionRecord};
    use crate::infra::{
        HistoryKey, InMemoryRedemptionStore, ManualClock, MockFraudCaseSink,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn voucher(code: &str, state: VoucherState, max: u32) -> Voucher {
        Voucher::new(
            BusinessId::new(),
            CategoryId::new(),
            now() - ChronoDuration::days(1),
            now() + ChronoDuration::days(1),
        )
        .with_state(state)
        .with_max_redemptions(max)
        .with_code(VoucherCode::new(code, CodeType::Short))
    }

    async fn setup(v: &Voucher) -> (Arc<InMemoryRedemptionStore>, RedemptionCoordinator) {
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(v).await.unwrap();
        let coordinator = RedemptionCoordinator::from_store(store.clone())
            .with_clock(Arc::new(ManualClock::new(now())))
            .with_retry(RetryConfig::fast());
        (store, coordinator)
    }

    /// Delegates to the in-memory store, failing the first commits with a
    /// conflict and optionally stalling each commit.
    struct FlakyRepository {
        inner: Arc<InMemoryRedemptionStore>,
        conflicts: AtomicU32,
        commits: AtomicU32,
        stall: Option<Duration>,
    }

    #[async_trait]
    impl VoucherRepository for FlakyRepository {
        async fn find_by_code(&self, code: &str) -> Result<Option<CodeMatch>> {
            self.inner.find_by_code(code).await
        }

        async fn get(&self, voucher_id: &VoucherId) -> Result<Option<Voucher>> {
            self.inner.get(voucher_id).await
        }

        async fn insert(&self, voucher: &Voucher) -> Result<()> {
            self.inner.insert(voucher).await
        }

        async fn user_redemption_count(
            &self,
            voucher_id: &VoucherId,
            user_id: &UserId,
        ) -> Result<u32> {
            self.inner.user_redemption_count(voucher_id, user_id).await
        }

        async fn atomic_reserve_and_commit(
            &self,
            voucher_id: &VoucherId,
            user_id: &UserId,
            mutation: &dyn CommitMutation,
        ) -> Result<CommitReceipt> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RedemptionError::Conflict(*voucher_id));
            }
            self.inner
                .atomic_reserve_and_commit(voucher_id, user_id, mutation)
                .await
        }

        async fn compare_and_set_state(
            &self,
            voucher_id: &VoucherId,
            expected: VoucherState,
            next: VoucherState,
            at: DateTime<Utc>,
        ) -> Result<Voucher> {
            self.inner
                .compare_and_set_state(voucher_id, expected, next, at)
                .await
        }

        async fn list_expirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Voucher>> {
            self.inner.list_expirable(now, limit).await
        }

        async fn delete(&self, voucher_id: &VoucherId) -> Result<()> {
            self.inner.delete(voucher_id).await
        }

        async fn redemptions_for(&self, voucher_id: &VoucherId) -> Result<Vec<RedemptionRecord>> {
            self.inner.redemptions_for(voucher_id).await
        }
    }

    fn flaky(
        store: &Arc<InMemoryRedemptionStore>,
        conflicts: u32,
        stall: Option<Duration>,
    ) -> Arc<FlakyRepository> {
        Arc::new(FlakyRepository {
            inner: store.clone(),
            conflicts: AtomicU32::new(conflicts),
            commits: AtomicU32::new(0),
            stall,
        })
    }

    #[tokio::test]
    async fn test_redeem_single_slot_voucher() {
        let v = voucher("ABC123", VoucherState::Claimed, 1);
        let (store, coordinator) = setup(&v).await;
        let user = UserId::new();

        let outcome = coordinator
            .redeem("ABC123", &user, &RedemptionContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.voucher_id, v.id);
        assert_eq!(outcome.state, VoucherState::Redeemed);
        assert_eq!(outcome.current_redemptions, 1);
        assert_eq!(outcome.remaining_redemptions, Some(0));
        assert_eq!(outcome.risk_score, 0);
        assert!(outcome.review_case_id.is_none());

        let records = store.redemptions_for(&v.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, outcome.record_id);
        assert_eq!(records[0].user_id, user);
        assert_eq!(records[0].redeemed_at, now());
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let v = voucher("KNOWN", VoucherState::Claimed, 1);
        let (_store, coordinator) = setup(&v).await;

        let err = coordinator
            .redeem("UNKNOWN", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::CodeNotFound));
    }

    #[tokio::test]
    async fn test_published_requires_claim_unless_direct() {
        let v = voucher("PUB", VoucherState::Published, 1);
        let (store, coordinator) = setup(&v).await;
        let user = UserId::new();

        let err = coordinator
            .redeem("PUB", &user, &RedemptionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RedemptionError::InvalidState {
                state: VoucherState::Published,
                ..
            }
        ));

        let direct = RedemptionCoordinator::from_store(store.clone())
            .with_clock(Arc::new(ManualClock::new(now())))
            .with_policy(RedemptionPolicy::default().with_direct_redemption(true));
        let outcome = direct
            .redeem("PUB", &user, &RedemptionContext::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, VoucherState::Redeemed);
    }

    #[tokio::test]
    async fn test_retry_after_success_is_invalid_state() {
        let v = voucher("ONCE", VoucherState::Claimed, 1);
        let (store, coordinator) = setup(&v).await;
        let user = UserId::new();
        let ctx = RedemptionContext::new();

        coordinator.redeem("ONCE", &user, &ctx).await.unwrap();
        let err = coordinator.redeem("ONCE", &user, &ctx).await.unwrap_err();

        assert!(matches!(
            err,
            RedemptionError::InvalidState {
                state: VoucherState::Redeemed,
                ..
            }
        ));
        assert_eq!(store.redemptions_for(&v.id).await.unwrap().len(), 1);

        let other = coordinator
            .redeem("ONCE", &UserId::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            other,
            RedemptionError::QuotaExceeded(QuotaError::GlobalLimitReached { max: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_logged() {
        let v = voucher("LOG", VoucherState::New, 1);
        let (store, coordinator) = setup(&v).await;
        let user = UserId::new();

        let _ = coordinator
            .redeem("LOG", &user, &RedemptionContext::new().with_device("dev-9"))
            .await
            .unwrap_err();

        let attempts = store
            .recent_attempts(&HistoryKey::User(user), now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(
            attempts[0].outcome,
            AttemptOutcome::Rejected {
                reason: "invalid_state".into()
            }
        );
        assert_eq!(attempts[0].device_fingerprint.as_deref(), Some("dev-9"));
    }

    #[tokio::test]
    async fn test_not_yet_valid_voucher_is_not_expired() {
        let mut v = voucher("EARLY", VoucherState::Claimed, 1);
        v.valid_from = now() + ChronoDuration::hours(1);
        let (store, coordinator) = setup(&v).await;

        let err = coordinator
            .redeem("EARLY", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RedemptionError::VoucherExpired(id) if id == v.id));
        assert_eq!(
            store.get(&v.id).await.unwrap().unwrap().state,
            VoucherState::Claimed
        );
    }

    #[tokio::test]
    async fn test_fraud_reject_survives_case_sink_failure() {
        let v = Voucher::new(
            BusinessId::new(),
            CategoryId::new(),
            now() - ChronoDuration::days(1),
            now() + ChronoDuration::days(1),
        )
        .with_state(VoucherState::Claimed)
        .with_code(VoucherCode::new("STATIC-1", CodeType::Static));
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(&v).await.unwrap();

        let mut sink = MockFraudCaseSink::new();
        sink.expect_create()
            .times(1)
            .returning(|_| Err(RedemptionError::Internal("sink unavailable".into())));

        let coordinator = RedemptionCoordinator::new(store.clone(), store.clone(), Arc::new(sink))
            .with_clock(Arc::new(ManualClock::new(now())));

        let err = coordinator
            .redeem(
                "STATIC-1",
                &UserId::new(),
                &RedemptionContext::new().expecting(CodeType::Qr),
            )
            .await
            .unwrap_err();

        match err {
            RedemptionError::FraudRejected { flags, case_id } => {
                assert_eq!(flags.len(), 1);
                assert!(flags[0].is_code_misuse());
                assert!(case_id.is_none());
            }
            other => panic!("expected fraud rejection, got {other:?}"),
        }

        let voucher = store.get(&v.id).await.unwrap().unwrap();
        assert_eq!(voucher.current_redemptions, 0);
        assert_eq!(voucher.state, VoucherState::Claimed);
        assert_eq!(store.attempts().await[0].outcome.as_str(), "flagged");
    }

    #[tokio::test]
    async fn test_fraud_reject_opens_case_through_sink() {
        let v = voucher("ABC", VoucherState::Claimed, 5);
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(&v).await.unwrap();

        let case_id = FraudCaseId::new();
        let mut sink = MockFraudCaseSink::new();
        sink.expect_create()
            .withf(|case| case.flags.iter().any(|f| f.is_code_misuse()))
            .times(1)
            .returning(move |_| Ok(case_id));

        let coordinator = RedemptionCoordinator::new(store.clone(), store.clone(), Arc::new(sink))
            .with_clock(Arc::new(ManualClock::new(now())));

        let err = coordinator
            .redeem(
                "ABC",
                &UserId::new(),
                &RedemptionContext::new().expecting(CodeType::Qr),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RedemptionError::FraudRejected { case_id: Some(id), .. } if id == case_id
        ));
        assert_eq!(err.to_string(), "redemption declined");
    }

    #[tokio::test]
    async fn test_commit_conflicts_are_retried() {
        let v = voucher("RETRY", VoucherState::Claimed, 1);
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(&v).await.unwrap();
        let repo = flaky(&store, 2, None);

        let metrics = Arc::new(MetricsRegistry::new());
        let coordinator = RedemptionCoordinator::new(repo.clone(), store.clone(), store.clone())
            .with_clock(Arc::new(ManualClock::new(now())))
            .with_retry(RetryConfig::fast())
            .with_metrics(metrics.clone());

        let outcome = coordinator
            .redeem("RETRY", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.current_redemptions, 1);
        assert_eq!(repo.commits.load(Ordering::SeqCst), 3);
        assert_eq!(store.redemptions_for(&v.id).await.unwrap().len(), 1);
        assert_eq!(metrics.get_counter(metric_names::COMMIT_RETRIES).await, 2);
    }

    #[tokio::test]
    async fn test_conflicts_beyond_retry_budget_surface() {
        let v = voucher("BUSY", VoucherState::Claimed, 1);
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(&v).await.unwrap();
        let repo = flaky(&store, 10, None);

        let coordinator = RedemptionCoordinator::new(repo.clone(), store.clone(), store.clone())
            .with_clock(Arc::new(ManualClock::new(now())))
            .with_retry(RetryConfig::fast().with_max_retries(1));

        let err = coordinator
            .redeem("BUSY", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RedemptionError::Conflict(_)));
        assert_eq!(repo.commits.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(&v.id).await.unwrap().unwrap().current_redemptions, 0);
    }

    #[tokio::test]
    async fn test_commit_timeout_leaves_no_reservation() {
        let v = voucher("SLOW", VoucherState::Claimed, 1);
        let store = Arc::new(InMemoryRedemptionStore::new());
        store.insert(&v).await.unwrap();
        let repo = flaky(&store, 0, Some(Duration::from_millis(500)));

        let coordinator = RedemptionCoordinator::new(repo, store.clone(), store.clone())
            .with_clock(Arc::new(ManualClock::new(now())))
            .with_policy(
                RedemptionPolicy::default().with_commit_timeout(Duration::from_millis(20)),
            );

        let err = coordinator
            .redeem("SLOW", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RedemptionError::Timeout(d) if d == Duration::from_millis(20)));
        let stored = store.get(&v.id).await.unwrap().unwrap();
        assert_eq!(stored.current_redemptions, 0);
        assert_eq!(stored.state, VoucherState::Claimed);
        assert!(store.redemptions_for(&v.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let v = voucher("M1", VoucherState::Claimed, 1);
        let (_store, coordinator) = setup(&v).await;
        let metrics = Arc::new(MetricsRegistry::new());
        let coordinator = coordinator.with_metrics(metrics.clone());
        let ctx = RedemptionContext::new();

        coordinator.redeem("M1", &UserId::new(), &ctx).await.unwrap();
        let _ = coordinator.redeem("M1", &UserId::new(), &ctx).await;
        let _ = coordinator.redeem("NOPE", &UserId::new(), &ctx).await;

        assert_eq!(metrics.get_counter(metric_names::REDEMPTIONS_ACCEPTED).await, 1);
        assert_eq!(
            metrics
                .get_counter("redemptions.rejected.quota_exceeded")
                .await,
            1
        );
        assert_eq!(
            metrics.get_counter("redemptions.rejected.code_not_found").await,
            1
        );
        assert_eq!(
            metrics
                .histogram_count(metric_names::REDEMPTION_LATENCY)
                .await,
            3
        );
        assert_eq!(
            metrics.histogram_count(metric_names::FRAUD_RISK_SCORE).await,
            1
        );
    }

    #[tokio::test]
    async fn test_administrative_transitions() {
        let v = voucher("ADMIN", VoucherState::New, 1);
        let (_store, coordinator) = setup(&v).await;

        assert!(coordinator.can_transition(&v, VoucherState::Published));
        assert!(!coordinator.can_transition(&v, VoucherState::Claimed));

        let published = coordinator
            .transition(&v.id, VoucherState::Published)
            .await
            .unwrap();
        assert_eq!(published.state, VoucherState::Published);
        assert_eq!(published.updated_at, now());

        let claimed = coordinator.claim(&v.id, &UserId::new()).await.unwrap();
        assert_eq!(claimed.state, VoucherState::Claimed);

        let err = coordinator
            .transition(&v.id, VoucherState::Redeemed)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::InvalidTransition(_)));

        let err = coordinator
            .transition(&v.id, VoucherState::New)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::InvalidTransition(_)));

        let expired = coordinator
            .transition(&v.id, VoucherState::Expired)
            .await
            .unwrap();
        assert_eq!(expired.state, VoucherState::Expired);
    }

    #[tokio::test]
    async fn test_transition_unknown_voucher() {
        let v = voucher("X", VoucherState::New, 1);
        let (_store, coordinator) = setup(&v).await;
        let missing = VoucherId::new();

        let err = coordinator
            .transition(&missing, VoucherState::Published)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::VoucherNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_delete_guard() {
        let v = voucher("DEL", VoucherState::Claimed, 2);
        let (store, coordinator) = setup(&v).await;
        coordinator
            .redeem("DEL", &UserId::new(), &RedemptionContext::new())
            .await
            .unwrap();

        let err = coordinator.delete_voucher(&v.id).await.unwrap_err();
        assert!(matches!(err, RedemptionError::VoucherInUse(_)));

        let fresh = voucher("FRESH", VoucherState::New, 1);
        store.insert(&fresh).await.unwrap();
        coordinator.delete_voucher(&fresh.id).await.unwrap();
        assert!(store.get(&fresh.id).await.unwrap().is_none());
    }
}
