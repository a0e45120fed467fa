//! Background daemon bootstrap.
//!
//! This module wires together:
//! - configuration
//! - database connection pool and migrations
//! - the Postgres redemption store and the redemption coordinator
//! - the expiry sweeper, running until Ctrl-C

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::infra::{
    spawn_expiry_sweeper, ExpirySweeperConfig, ExpirySweeperMessage, FraudCaseSink, FraudHistory,
    PgRedemptionStore, RetryConfig, SystemClock, VoucherRepository,
};
use crate::metrics::MetricsRegistry;
use crate::redemption::{FraudConfig, RedemptionCoordinator, RedemptionPolicy};
use crate::telemetry::{init_telemetry, TelemetryConfig};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Apply embedded migrations before starting.
    pub migrate_on_startup: bool,
    pub sweeper: ExpirySweeperConfig,
    pub policy: RedemptionPolicy,
    pub fraud: FraudConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let database_url = var("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/voucher_redemption".to_string());

        let max_connections: u32 = var("MAX_DB_CONNECTIONS")
            .and_then(|p| p.trim().parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(10);

        let migrate_on_startup = var("DB_MIGRATE_ON_STARTUP")
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        Self {
            database_url,
            max_connections,
            migrate_on_startup,
            sweeper: ExpirySweeperConfig::from_vars(&var),
            policy: RedemptionPolicy::from_vars(&var),
            fraud: FraudConfig::from_vars(&var),
            retry: RetryConfig::from_vars(&var),
        }
    }

    /// Coordinator over `store` with this configuration's policy, fraud
    /// tunables and retry budget
    pub fn coordinator<S>(&self, store: Arc<S>) -> RedemptionCoordinator
    where
        S: VoucherRepository + FraudHistory + FraudCaseSink + 'static,
    {
        RedemptionCoordinator::from_store(store)
            .with_policy(self.policy.clone())
            .with_fraud_config(self.fraud.clone())
            .with_retry(self.retry.clone())
    }
}

/// Run the daemon until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())?;

    info!("Starting voucherd v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    info!(
        max_connections = config.max_connections,
        sweep_interval_secs = config.sweeper.interval.as_secs(),
        sweep_batch = config.sweeper.batch_size,
        "Configuration loaded"
    );

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    info!("Connected to PostgreSQL");

    if config.migrate_on_startup {
        info!("Running database migrations...");
        crate::migrations::run_postgres(&pool).await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }

    let store = Arc::new(PgRedemptionStore::new(pool.clone()));
    let metrics = Arc::new(MetricsRegistry::new());
    let coordinator = config.coordinator(store.clone()).with_metrics(metrics.clone());
    info!(
        allow_direct = coordinator.policy().allow_direct,
        multi_use = coordinator.policy().multi_use,
        commit_timeout_ms = coordinator.policy().commit_timeout.as_millis() as u64,
        review_threshold = coordinator.engine().config().review_threshold,
        reject_threshold = coordinator.engine().config().reject_threshold,
        max_retries = coordinator.retry_config().max_retries,
        "Redemption coordinator ready"
    );

    let (handle, control) =
        spawn_expiry_sweeper(config.sweeper.clone(), store, Arc::new(SystemClock));

    info!("voucherd is running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if control.send(ExpirySweeperMessage::Shutdown).await.is_err() {
        warn!("expiry sweeper already stopped");
    }
    handle.await?;
    pool.close().await;

    info!(metrics = %metrics.to_json().await, "voucherd stopped");
    Ok(())
}
