//! Fraud scoring engine
//!
//! Evaluates a redemption attempt against recent attempt history and
//! produces a risk score in `[0, 100]`, an ordered list of flags and a
//! decision. Scoring is a pure function of `(input, history, now)`; history
//! loading is a separate step so the same inputs always score the same.
//!
//! # Heuristics
//!
//! | Flag                  | Fires when                                                    |
//! |-----------------------|---------------------------------------------------------------|
//! | `code_misuse`         | inactive code, or code type differs from the expected one     |
//! | `high_velocity`       | more than K attempts by the user inside the velocity window   |
//! | `impossible_travel`   | implied speed from a previous located attempt exceeds the cap |
//! | `shared_device_abuse` | the device fingerprint was used by other users recently       |
//!
//! # Configuration
//!
//! - `FRAUD_VELOCITY_LIMIT` (default: 5)
//! - `FRAUD_VELOCITY_WINDOW_SECS` (default: 600)
//! - `FRAUD_MAX_SPEED_KMH` (default: 900)
//! - `FRAUD_EXTREME_SPEED_FACTOR` (default: 10)
//! - `FRAUD_TRAVEL_LOOKBACK_SECS` (default: 86400)
//! - `FRAUD_MIN_TRAVEL_KM` (default: 1)
//! - `FRAUD_SHARED_DEVICE_WINDOW_SECS` (default: 86400)
//! - `FRAUD_SHARED_DEVICE_MIN_USERS` (default: 1)
//! - `FRAUD_REVIEW_THRESHOLD` (default: 30)
//! - `FRAUD_REJECT_THRESHOLD` (default: 70)
//!
//! Window lengths are whole seconds, capped at one year. Values that do not
//! parse fall back to the default.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    AttemptSummary, CodeMisuse, FraudAssessment, FraudDecision, FraudFlag, RedemptionContext,
    Severity, UserId, Voucher, VoucherCode, MAX_RISK_SCORE,
};
use crate::infra::{FraudHistory, HistoryKey, Result};

/// Other users on one device at which shared-device severity becomes High
const SHARED_DEVICE_HIGH_USERS: u32 = 3;

/// Longest history window accepted from configuration (one year)
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Start of a look-back window, saturating at the earliest representable time
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window.max(Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Tunables for the heuristics and the decision policy
#[derive(Debug, Clone)]
pub struct FraudConfig {
    /// K: attempts allowed inside the velocity window
    pub velocity_limit: u32,
    pub velocity_window: Duration,
    /// Fastest plausible travel between two attempts
    pub max_travel_speed_kmh: f64,
    /// Multiple of the plausible speed treated as critical
    pub extreme_speed_factor: f64,
    pub travel_lookback: Duration,
    /// Distances below this are treated as GPS noise
    pub min_travel_distance_km: f64,
    pub shared_device_window: Duration,
    pub shared_device_min_other_users: u32,
    /// Scores at or above this open a review case
    pub review_threshold: u8,
    /// Scores at or above this reject
    pub reject_threshold: u8,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            velocity_limit: 5,
            velocity_window: Duration::minutes(10),
            max_travel_speed_kmh: 900.0,
            extreme_speed_factor: 10.0,
            travel_lookback: Duration::hours(24),
            min_travel_distance_km: 1.0,
            shared_device_window: Duration::hours(24),
            shared_device_min_other_users: 1,
            review_threshold: 30,
            reject_threshold: 70,
        }
    }
}

impl FraudConfig {
    /// Load configuration from environment, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup. Unparseable or out-of-range values
    /// fall back to the defaults; windows are capped at [`MAX_WINDOW_SECS`].
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| var(key).and_then(|v| v.trim().parse::<f64>().ok());
        let window = |key: &str, default: Duration| {
            var(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .and_then(|secs| Duration::try_seconds(secs.min(MAX_WINDOW_SECS) as i64))
                .unwrap_or(default)
        };
        let count = |key: &str| var(key).and_then(|v| v.trim().parse::<u32>().ok());
        let threshold = |key: &str| {
            var(key)
                .and_then(|v| v.trim().parse::<u8>().ok())
                .filter(|t| *t <= MAX_RISK_SCORE)
        };

        Self {
            velocity_limit: count("FRAUD_VELOCITY_LIMIT").unwrap_or(defaults.velocity_limit),
            velocity_window: window("FRAUD_VELOCITY_WINDOW_SECS", defaults.velocity_window),
            max_travel_speed_kmh: parse("FRAUD_MAX_SPEED_KMH")
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(defaults.max_travel_speed_kmh),
            extreme_speed_factor: parse("FRAUD_EXTREME_SPEED_FACTOR")
                .filter(|v| v.is_finite() && *v >= 1.0)
                .unwrap_or(defaults.extreme_speed_factor),
            travel_lookback: window("FRAUD_TRAVEL_LOOKBACK_SECS", defaults.travel_lookback),
            min_travel_distance_km: parse("FRAUD_MIN_TRAVEL_KM")
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(defaults.min_travel_distance_km),
            shared_device_window: window(
                "FRAUD_SHARED_DEVICE_WINDOW_SECS",
                defaults.shared_device_window,
            ),
            shared_device_min_other_users: count("FRAUD_SHARED_DEVICE_MIN_USERS")
                .unwrap_or(defaults.shared_device_min_other_users),
            review_threshold: threshold("FRAUD_REVIEW_THRESHOLD")
                .unwrap_or(defaults.review_threshold),
            reject_threshold: threshold("FRAUD_REJECT_THRESHOLD")
                .unwrap_or(defaults.reject_threshold),
        }
    }

    /// How far back the per-user history has to reach
    pub fn user_lookback(&self) -> Duration {
        self.velocity_window.max(self.travel_lookback)
    }
}

/// The attempt being scored
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub voucher: &'a Voucher,
    pub user_id: &'a UserId,
    pub code: &'a VoucherCode,
    pub context: &'a RedemptionContext,
}

/// History the heuristics read, loaded before scoring
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// The user's attempts, oldest first
    pub by_user: Vec<AttemptSummary>,
    /// Attempts made with the same device fingerprint, oldest first
    pub by_device: Vec<AttemptSummary>,
}

/// Scores redemption attempts. Holds configuration only.
#[derive(Debug, Clone, Default)]
pub struct FraudScoringEngine {
    config: FraudConfig,
}

impl FraudScoringEngine {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    /// Load history for `input` and score it.
    #[tracing::instrument(skip(self, history, input), fields(voucher_id = %input.voucher.id, user_id = %input.user_id))]
    pub async fn evaluate(
        &self,
        history: &dyn FraudHistory,
        input: ScoringInput<'_>,
        now: DateTime<Utc>,
    ) -> Result<FraudAssessment> {
        let snapshot = self.load_history(history, &input, now).await?;
        let assessment = self.score(&input, &snapshot, now);

        tracing::debug!(
            score = assessment.score,
            decision = assessment.decision.as_str(),
            flags = ?assessment.flag_kinds(),
            "attempt scored"
        );

        Ok(assessment)
    }

    /// Fetch per-user and per-device history concurrently
    pub async fn load_history(
        &self,
        history: &dyn FraudHistory,
        input: &ScoringInput<'_>,
        now: DateTime<Utc>,
    ) -> Result<HistorySnapshot> {
        let user_key = HistoryKey::User(*input.user_id);
        let user_since = window_start(now, self.config.user_lookback());
        let device_since = window_start(now, self.config.shared_device_window);
        let fingerprint = input.context.device_fingerprint().map(str::to_owned);

        let by_user = history.recent_attempts(&user_key, user_since);
        let by_device = async {
            match fingerprint {
                Some(fp) => history.recent_attempts(&HistoryKey::Device(fp), device_since).await,
                None => Ok(Vec::new()),
            }
        };

        let (by_user, by_device) = tokio::try_join!(by_user, by_device)?;
        Ok(HistorySnapshot { by_user, by_device })
    }

    /// Pure scoring step.
    ///
    /// Flags are emitted in a fixed order: code misuse, velocity, travel,
    /// shared device.
    pub fn score(
        &self,
        input: &ScoringInput<'_>,
        history: &HistorySnapshot,
        now: DateTime<Utc>,
    ) -> FraudAssessment {
        let mut flags = Vec::new();

        self.check_code(input, &mut flags);
        flags.extend(self.check_velocity(history, now));
        flags.extend(self.check_travel(input, history, now));
        flags.extend(self.check_shared_device(input, history, now));

        let score = Self::aggregate(&flags);
        let decision = self.decide(score, &flags);

        FraudAssessment {
            score,
            flags,
            decision,
        }
    }

    /// Map a score and flags to a decision. Code misuse always rejects.
    pub fn decide(&self, score: u8, flags: &[FraudFlag]) -> FraudDecision {
        if flags.iter().any(FraudFlag::is_code_misuse) || score >= self.config.reject_threshold {
            FraudDecision::Reject
        } else if score >= self.config.review_threshold {
            FraudDecision::Review
        } else {
            FraudDecision::Accept
        }
    }

    /// Sum of severity weights, capped at 100
    pub fn aggregate(flags: &[FraudFlag]) -> u8 {
        let total: u32 = flags.iter().map(|f| u32::from(f.severity().weight())).sum();
        total.min(u32::from(MAX_RISK_SCORE)) as u8
    }

    fn check_code(&self, input: &ScoringInput<'_>, flags: &mut Vec<FraudFlag>) {
        if !input.code.is_active {
            flags.push(FraudFlag::CodeMisuse {
                severity: Severity::High,
                misuse: CodeMisuse::InactiveCode {
                    code: input.code.code.clone(),
                },
            });
        }

        if let Some(expected) = input.context.expected_code_type {
            if expected != input.code.code_type {
                flags.push(FraudFlag::CodeMisuse {
                    severity: Severity::High,
                    misuse: CodeMisuse::TypeMismatch {
                        expected,
                        presented: input.code.code_type,
                    },
                });
            }
        }
    }

    fn check_velocity(&self, history: &HistorySnapshot, now: DateTime<Utc>) -> Option<FraudFlag> {
        let since = window_start(now, self.config.velocity_window);
        let prior = history
            .by_user
            .iter()
            .filter(|a| a.attempted_at >= since && a.attempted_at <= now)
            .count() as u32;
        // the current attempt counts too
        let attempts = prior + 1;

        if attempts <= self.config.velocity_limit {
            return None;
        }

        let severity = match attempts - self.config.velocity_limit {
            1..=2 => Severity::Low,
            3..=5 => Severity::Medium,
            _ => Severity::High,
        };

        Some(FraudFlag::HighVelocity {
            severity,
            attempts,
            limit: self.config.velocity_limit,
            window_secs: self.config.velocity_window.num_seconds(),
        })
    }

    fn check_travel(
        &self,
        input: &ScoringInput<'_>,
        history: &HistorySnapshot,
        now: DateTime<Utc>,
    ) -> Option<FraudFlag> {
        let here = input.context.location.filter(|p| p.is_valid())?;
        let since = window_start(now, self.config.travel_lookback);

        let (distance_km, elapsed_secs, speed_kmh) = history
            .by_user
            .iter()
            .filter(|a| a.attempted_at >= since)
            .filter_map(|a| {
                let there = a.location.filter(|p| p.is_valid())?;
                let distance = here.distance_km(&there);
                if distance < self.config.min_travel_distance_km {
                    return None;
                }
                // clamp so simultaneous attempts do not divide by zero
                let elapsed = (now - a.attempted_at).num_seconds().max(1);
                let speed = distance / (elapsed as f64 / 3600.0);
                Some((distance, elapsed, speed))
            })
            .max_by(|a, b| a.2.total_cmp(&b.2))?;

        if speed_kmh <= self.config.max_travel_speed_kmh {
            return None;
        }

        let severity =
            if speed_kmh > self.config.max_travel_speed_kmh * self.config.extreme_speed_factor {
                Severity::Critical
            } else {
                Severity::High
            };

        Some(FraudFlag::ImpossibleTravel {
            severity,
            distance_km,
            elapsed_secs,
            speed_kmh,
        })
    }

    fn check_shared_device(
        &self,
        input: &ScoringInput<'_>,
        history: &HistorySnapshot,
        now: DateTime<Utc>,
    ) -> Option<FraudFlag> {
        let fingerprint = input.context.device_fingerprint()?;
        let since = window_start(now, self.config.shared_device_window);

        let others: BTreeSet<UserId> = history
            .by_device
            .iter()
            .filter(|a| a.attempted_at >= since)
            .filter(|a| a.device_fingerprint.as_deref() == Some(fingerprint))
            .map(|a| a.user_id)
            .filter(|u| u != input.user_id)
            .collect();
        let other_users = others.len() as u32;

        if other_users == 0 || other_users < self.config.shared_device_min_other_users {
            return None;
        }

        let severity = if other_users >= SHARED_DEVICE_HIGH_USERS {
            Severity::High
        } else {
            Severity::Medium
        };

        Some(FraudFlag::SharedDeviceAbuse {
            severity,
            fingerprint: fingerprint.to_owned(),
            other_users,
        })
    }
}
