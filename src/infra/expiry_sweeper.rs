//! Expiry Sweeper
//!
//! Background service that moves vouchers past their `expires_at` to
//! EXPIRED. Each tick it:
//!
//! 1. Lists non-terminal vouchers whose expiry has passed (oldest first)
//! 2. Validates the transition through the state machine
//! 3. Applies it with a compare-and-set, so a concurrent redemption or
//!    administrative change wins and the voucher is re-examined next tick
//!
//! # Configuration
//!
//! - `EXPIRY_SWEEP_INTERVAL_SECS` - How often to sweep (default: 60)
//! - `EXPIRY_SWEEP_BATCH` - Maximum vouchers per sweep (default: 500)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::domain::{VoucherState, VoucherStateMachine};

use super::{Clock, RedemptionError, Result, VoucherRepository};

/// Configuration for the expiry sweeper
#[derive(Debug, Clone)]
pub struct ExpirySweeperConfig {
    /// How often to sweep
    pub interval: Duration,
    /// Maximum vouchers expired per sweep
    pub batch_size: usize,
}

impl Default for ExpirySweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

impl ExpirySweeperConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let interval = var("EXPIRY_SWEEP_INTERVAL_SECS")
            .and_then(|s| s.trim().parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        let batch_size = var("EXPIRY_SWEEP_BATCH")
            .and_then(|s| s.trim().parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.batch_size);

        Self {
            interval,
            batch_size,
        }
    }
}

/// Control messages for the sweeper
#[derive(Debug)]
pub enum ExpirySweeperMessage {
    /// Sweep immediately, optionally reporting the result
    SweepNow(Option<oneshot::Sender<SweepReport>>),
    /// Shutdown the sweeper
    Shutdown,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// State changed between listing and the compare-and-set
    pub conflicts: usize,
    pub failed: usize,
}

/// Expiry sweeper
///
/// Runs as a background task, or call [`ExpirySweeper::sweep_once`]
/// directly.
pub struct ExpirySweeper {
    config: ExpirySweeperConfig,
    repository: Arc<dyn VoucherRepository>,
    clock: Arc<dyn Clock>,
    control_tx: mpsc::Sender<ExpirySweeperMessage>,
    control_rx: mpsc::Receiver<ExpirySweeperMessage>,
}

impl ExpirySweeper {
    pub fn new(
        config: ExpirySweeperConfig,
        repository: Arc<dyn VoucherRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            config,
            repository,
            clock,
            control_tx,
            control_rx,
        }
    }

    /// Get a sender handle for controlling the sweeper
    pub fn control_handle(&self) -> mpsc::Sender<ExpirySweeperMessage> {
        self.control_tx.clone()
    }

    /// Expire one batch of overdue vouchers
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let overdue = self
            .repository
            .list_expirable(now, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: overdue.len(),
            ..SweepReport::default()
        };

        for voucher in overdue {
            let next = match VoucherStateMachine::transition(voucher.state, VoucherState::Expired) {
                Ok(next) => next,
                Err(e) => {
                    debug!(voucher_id = %voucher.id, error = %e, "skipping voucher");
                    continue;
                }
            };

            match self
                .repository
                .compare_and_set_state(&voucher.id, voucher.state, next, now)
                .await
            {
                Ok(_) => {
                    report.expired += 1;
                    debug!(voucher_id = %voucher.id, from = %voucher.state, "voucher expired");
                }
                Err(RedemptionError::Conflict(_)) | Err(RedemptionError::VoucherNotFound(_)) => {
                    report.conflicts += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(voucher_id = %voucher.id, error = %e, "failed to expire voucher");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                conflicts = report.conflicts,
                failed = report.failed,
                "expiry sweep finished"
            );
        }

        Ok(report)
    }

    /// Run the sweeper until shut down
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry sweeper"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "expiry sweep failed");
                    }
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        ExpirySweeperMessage::SweepNow(reply) => {
                            match self.sweep_once().await {
                                Ok(report) => {
                                    if let Some(reply) = reply {
                                        let _ = reply.send(report);
                                    }
                                }
                                Err(e) => error!(error = %e, "forced expiry sweep failed"),
                            }
                        }
                        ExpirySweeperMessage::Shutdown => {
                            info!("expiry sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Spawn the expiry sweeper as a background task
pub fn spawn_expiry_sweeper(
    config: ExpirySweeperConfig,
    repository: Arc<dyn VoucherRepository>,
    clock: Arc<dyn Clock>,
) -> (
    tokio::task::JoinHandle<()>,
    mpsc::Sender<ExpirySweeperMessage>,
) {
    let sweeper = ExpirySweeper::new(config, repository, clock);
    let control_handle = sweeper.control_handle();
    let handle = tokio::spawn(sweeper.run());
    (handle, control_handle)
}
