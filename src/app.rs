use crate::config::{Config, DegradedPolicy};
use crate::data::health::{self, ProbeError, ProbeOutcome, ProbeTarget};
use crate::utils::fmt_duration;
use anyhow::Context;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Reasons the boot sequence refuses to continue.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("startup database check failed")]
    Probe(#[from] ProbeError),
    #[error("database answered the startup probe with {observed:?}, and DEGRADED_POLICY is abort")]
    Degraded { observed: Option<i32> },
}

/// Decide whether a completed probe lets startup continue.
pub fn apply_degraded_policy(
    outcome: ProbeOutcome,
    policy: DegradedPolicy,
) -> Result<(), StartupError> {
    match (outcome, policy) {
        (ProbeOutcome::Healthy, _) => Ok(()),
        (ProbeOutcome::Degraded { observed }, DegradedPolicy::Warn) => {
            warn!(observed = ?observed, "continuing startup with degraded database");
            Ok(())
        }
        (ProbeOutcome::Degraded { observed }, DegradedPolicy::Abort) => {
            Err(StartupError::Degraded { observed })
        }
    }
}

/// Run every startup check against `target` and apply the configured policy.
pub async fn run_startup_checks<T>(
    target: &T,
    probe_timeout: Duration,
    policy: DegradedPolicy,
) -> Result<ProbeOutcome, StartupError>
where
    T: ProbeTarget + ?Sized,
{
    let outcome = health::run_startup_check(target, probe_timeout).await?;
    apply_degraded_policy(outcome, policy)?;
    Ok(outcome)
}

/// Main application struct: configuration plus the database pool it owns.
pub struct App {
    config: Config,
    db_pool: PgPool,
}

impl App {
    /// Build the database pool without connecting.
    ///
    /// The startup check makes the first connection, so a bad host or bad
    /// credentials surface as a probe failure.
    pub fn new(config: Config) -> Result<Self, anyhow::Error> {
        let connect_options = PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.db_max_connections)
            .acquire_timeout(config.db_acquire_timeout)
            .connect_lazy_with(connect_options);

        info!(
            max_connections = config.db_max_connections,
            acquire_timeout = fmt_duration(config.db_acquire_timeout),
            probe_timeout = fmt_duration(config.probe_timeout),
            degraded_policy = ?config.degraded_policy,
            "database pool configured"
        );

        Ok(App { config, db_pool })
    }

    /// Run the startup checks. An `Err` means the service must not start.
    pub async fn startup(&self) -> Result<ProbeOutcome, StartupError> {
        let start = Instant::now();
        let outcome = run_startup_checks(
            &self.db_pool,
            self.config.probe_timeout,
            self.config.degraded_policy,
        )
        .await?;
        info!(
            healthy = outcome.is_healthy(),
            duration = fmt_duration(start.elapsed()),
            "service ready"
        );
        Ok(outcome)
    }

    /// Serve until a shutdown signal arrives, then release the pool.
    pub async fn run(self) -> ExitCode {
        match wait_for_shutdown().await {
            Ok(signal) => info!(signal, "shutdown signal received"),
            Err(e) => {
                error!(error = ?e, "failed to listen for shutdown signals");
                self.close().await;
                return ExitCode::FAILURE;
            }
        }
        self.close().await;
        ExitCode::SUCCESS
    }

    /// Close every pooled connection.
    pub async fn close(self) {
        self.db_pool.close().await;
        info!("database pool closed");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
