//! Database health checks run during startup.
//!
//! The startup check issues one fixed `SELECT 1` and classifies the answer.
//! It never retries: a single failed query is reported to the caller, which
//! decides whether to abort the boot sequence.

use async_trait::async_trait;
use sqlx::{ConnectOptions, Connection, PgPool};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::utils::{fmt_duration, log_if_slow};

/// The fixed, side-effect-free probe query.
pub const PROBE_QUERY: &str = "SELECT 1";

/// Value a healthy database answers [`PROBE_QUERY`] with.
pub const EXPECTED_RESULT: i32 = 1;

/// Probes slower than this are logged as slow even when they succeed.
const SLOW_PROBE_THRESHOLD: Duration = Duration::from_millis(500);

/// Something the startup check can run the probe query against.
///
/// Implemented for [`PgPool`] using a dedicated connection built from the
/// pool's connect options, so there is exactly one connection attempt.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// Run [`PROBE_QUERY`] and return its single scalar, which may be null.
    async fn select_one(&self) -> Result<Option<i32>, sqlx::Error>;
}

#[async_trait]
impl ProbeTarget for PgPool {
    async fn select_one(&self) -> Result<Option<i32>, sqlx::Error> {
        // `acquire` retries refused connections until the acquire timeout and
        // then reports `PoolTimedOut`; connecting directly keeps the real cause.
        let mut conn = self.connect_options().connect().await?;
        let value = sqlx::query_scalar::<_, Option<i32>>(PROBE_QUERY)
            .fetch_one(&mut conn)
            .await;
        if let Err(e) = conn.close().await {
            debug!(error = ?e, "failed to close startup check connection");
        }
        value
    }
}

/// Result of a probe query that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The database answered with [`EXPECTED_RESULT`].
    Healthy,
    /// The query succeeded but answered with something else (or null).
    Degraded { observed: Option<i32> },
}

impl ProbeOutcome {
    pub fn classify(value: Option<i32>) -> Self {
        match value {
            Some(EXPECTED_RESULT) => Self::Healthy,
            observed => Self::Degraded { observed },
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// The probe query itself could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("database probe query failed")]
    Query(#[source] sqlx::Error),
    #[error("database probe did not finish within {0:.2?}")]
    TimedOut(Duration),
}

/// Run the startup database check once.
///
/// Logs the start of the check, the classification of the answer, and a
/// completion line. When the query fails (or exceeds `timeout`) the
/// completion line is not logged and the error is returned for the caller
/// to treat as fatal. A degraded answer is logged but returned as `Ok`.
pub async fn run_startup_check<T>(target: &T, timeout: Duration) -> Result<ProbeOutcome, ProbeError>
where
    T: ProbeTarget + ?Sized,
{
    info!("Starting DB checks");
    let start = Instant::now();

    let result = match tokio::time::timeout(timeout, target.select_one()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ProbeError::Query(e)),
        Err(_) => Err(ProbeError::TimedOut(timeout)),
    };

    let value = match result {
        Ok(value) => value,
        Err(e) => {
            warn!(error = ?e, duration = fmt_duration(start.elapsed()), "DB checks failed");
            return Err(e);
        }
    };

    log_if_slow(start, SLOW_PROBE_THRESHOLD, "startup DB check");

    let outcome = ProbeOutcome::classify(value);
    match outcome {
        ProbeOutcome::Healthy => {
            debug!(duration = fmt_duration(start.elapsed()), "probe answered");
            info!("DB checks successful");
        }
        ProbeOutcome::Degraded { observed } => {
            warn!(
                expected = EXPECTED_RESULT,
                observed = ?observed,
                "DB responded with unexpected result"
            );
        }
    }

    info!("System status check completed");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Answers the probe with a canned value, or fails.
    enum FakeDb {
        Answer(Option<i32>),
        Fail,
        Hang,
    }

    #[async_trait]
    impl ProbeTarget for FakeDb {
        async fn select_one(&self) -> Result<Option<i32>, sqlx::Error> {
            match self {
                FakeDb::Answer(value) => Ok(*value),
                FakeDb::Fail => Err(sqlx::Error::PoolTimedOut),
                FakeDb::Hang => std::future::pending().await,
            }
        }
    }

    /// Records `(level, message)` for every event emitted while installed.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Level, String)>>>);

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Recorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    impl Recorder {
        /// Events at INFO and above, in emission order.
        fn lines(&self) -> Vec<(Level, String)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(level, _)| *level <= Level::INFO)
                .cloned()
                .collect()
        }
    }

    async fn run_recorded(db: &FakeDb) -> (Result<ProbeOutcome, ProbeError>, Vec<(Level, String)>) {
        let recorder = Recorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let _guard = tracing::subscriber::set_default(subscriber);
        let result = run_startup_check(db, Duration::from_millis(200)).await;
        (result, recorder.lines())
    }

    fn line(level: Level, msg: &str) -> (Level, String) {
        (level, msg.to_owned())
    }

    #[test]
    fn test_classify() {
        assert_eq!(ProbeOutcome::classify(Some(1)), ProbeOutcome::Healthy);
        assert_eq!(
            ProbeOutcome::classify(Some(0)),
            ProbeOutcome::Degraded { observed: Some(0) }
        );
        assert_eq!(
            ProbeOutcome::classify(Some(-1)),
            ProbeOutcome::Degraded { observed: Some(-1) }
        );
        assert_eq!(
            ProbeOutcome::classify(None),
            ProbeOutcome::Degraded { observed: None }
        );
        assert!(ProbeOutcome::Healthy.is_healthy());
        assert!(!ProbeOutcome::classify(None).is_healthy());
    }

    #[tokio::test]
    async fn test_healthy_answer_logs_success_and_completion() {
        let (result, lines) = run_recorded(&FakeDb::Answer(Some(1))).await;

        assert_eq!(result.unwrap(), ProbeOutcome::Healthy);
        assert_eq!(
            lines,
            vec![
                line(Level::INFO, "Starting DB checks"),
                line(Level::INFO, "DB checks successful"),
                line(Level::INFO, "System status check completed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unexpected_answer_warns_but_continues() {
        let (result, lines) = run_recorded(&FakeDb::Answer(Some(0))).await;

        assert_eq!(
            result.unwrap(),
            ProbeOutcome::Degraded { observed: Some(0) }
        );
        assert_eq!(
            lines,
            vec![
                line(Level::INFO, "Starting DB checks"),
                line(Level::WARN, "DB responded with unexpected result"),
                line(Level::INFO, "System status check completed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_null_answer_is_degraded() {
        let (result, lines) = run_recorded(&FakeDb::Answer(None)).await;

        assert_eq!(result.unwrap(), ProbeOutcome::Degraded { observed: None });
        assert_eq!(lines[1], line(Level::WARN, "DB responded with unexpected result"));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_query_failure_skips_completion() {
        let (result, lines) = run_recorded(&FakeDb::Fail).await;

        assert!(matches!(result, Err(ProbeError::Query(sqlx::Error::PoolTimedOut))));
        assert_eq!(
            lines,
            vec![
                line(Level::INFO, "Starting DB checks"),
                line(Level::WARN, "DB checks failed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_hung_query_times_out() {
        let (result, lines) = run_recorded(&FakeDb::Hang).await;

        match result {
            Err(ProbeError::TimedOut(limit)) => assert_eq!(limit, Duration::from_millis(200)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(lines.last(), Some(&line(Level::WARN, "DB checks failed")));
        assert!(!lines.iter().any(|(_, m)| m == "System status check completed"));
    }

    #[tokio::test]
    async fn test_repeated_runs_log_identically() {
        let db = FakeDb::Answer(Some(7));
        let (first, first_lines) = run_recorded(&db).await;
        let (second, second_lines) = run_recorded(&db).await;

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(first_lines, second_lines);
    }
}
