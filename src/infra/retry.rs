//! Bounded exponential backoff for store conflicts
//!
//! Only the commit step is retried, and only for errors a predicate marks as
//! transient (row conflicts, serialization failures, dropped connections).
//! Business-rule failures are returned on the first attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Upper bound on configured retries
pub const MAX_RETRIES: u32 = 20;

/// Backoff settings for retried store operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Jitter factor in `0.0..=1.0`
    pub jitter: f64,
    /// Pick delays from `[initial, 3 * base]` instead of `base ± jitter`
    pub decorrelated_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::database()
    }
}

impl RetryConfig {
    /// Short delays, for the in-memory store and tests
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.3,
            decorrelated_jitter: false,
        }
    }

    /// Defaults for Postgres row conflicts
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
            decorrelated_jitter: true,
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::fast()
        }
    }

    /// Load overrides from `REDEMPTION_RETRY_MAX` and
    /// `REDEMPTION_RETRY_INITIAL_DELAY_MS` on top of [`RetryConfig::database`].
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`RetryConfig::from_env`] with an explicit variable lookup.
    /// The retry count is capped at [`MAX_RETRIES`] and the initial delay at
    /// `max_delay`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::database();
        if let Some(max) = var("REDEMPTION_RETRY_MAX").and_then(|v| v.trim().parse::<u32>().ok()) {
            config.max_retries = max.min(MAX_RETRIES);
        }
        if let Some(ms) = var("REDEMPTION_RETRY_INITIAL_DELAY_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.initial_delay = Duration::from_millis(ms).min(config.max_delay);
        }
        config
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32)).min(max);

        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }

        let mut rng = rand::thread_rng();
        let delay = if self.decorrelated_jitter {
            let low = self.initial_delay.as_secs_f64().min(max);
            let high = (base * 3.0).min(max).max(low);
            rng.gen_range(low..=high)
        } else {
            let spread = base * self.jitter;
            (base + rng.gen_range(-spread..=spread)).max(0.0)
        };

        Duration::from_secs_f64(delay)
    }
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    /// 1 = succeeded or failed on the first try
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Runs an async operation until it succeeds, fails permanently, or the
/// retry budget is spent
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry while `should_retry(&err)` holds
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let err = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(attempts, "operation succeeded after retries");
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(err) => err,
            };

            if attempts > self.config.max_retries || !should_retry(&err) {
                return RetryResult {
                    result: Err(err),
                    attempts,
                    total_duration: start.elapsed(),
                };
            }

            let delay = self.config.delay_for_attempt(attempts - 1);
            tracing::debug!(
                attempt = attempts,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Whether a database error is transient
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // serialization failure, deadlock, connection exception, operator intervention
            code == "40001" || code == "40P01" || code.starts_with("08") || code.starts_with("57")
        }
        _ => false,
    }
}
