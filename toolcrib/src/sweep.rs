//! Periodic alert sweep.
//!
//! Each run detects overdue reservations, raises the missing overdue and
//! condition alerts, and resolves alerts whose condition cleared. Every step
//! is idempotent, so a run that fails on a transient error is retried whole
//! with backoff, and a run that still fails is simply redone on the next tick.

use crate::alerts::AlertGenerator;
use crate::config::SweepConfig;
use crate::error::AlertError;
use crate::overdue::detect_overdue;
use crate::persistence::{ReservationFilter, WorkshopStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use toolcrib_core::environment::Clock;
use toolcrib_runtime::retry::{RetryPolicy, retry_with_predicate};

/// What one sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue reservations found
    pub overdue: usize,
    /// Alerts raised
    pub created: usize,
    /// Conditions already alerted
    pub deduplicated: usize,
    /// Alerts resolved
    pub resolved: usize,
    /// Items skipped on a non-transient error
    pub failed: usize,
}

/// Runs the sweep once or on an interval
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn WorkshopStore>,
    generator: AlertGenerator,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    interval: Duration,
}

impl Sweeper {
    /// Sweeper reading reservations from `store`
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkshopStore>,
        generator: AlertGenerator,
        clock: Arc<dyn Clock>,
        config: &SweepConfig,
    ) -> Self {
        Self {
            store,
            generator,
            clock,
            policy: config.retry_policy(),
            interval: config.interval(),
        }
    }

    /// One sweep, retried with backoff while it fails on transient errors.
    ///
    /// # Errors
    ///
    /// The last transient error once retries are exhausted, or the first
    /// non-transient error from listing reservations or tools.
    pub async fn run_once(&self) -> Result<SweepReport, AlertError> {
        let start = Instant::now();
        let result = retry_with_predicate(&self.policy, || self.sweep(), AlertError::is_retryable).await;
        metrics::histogram!("toolcrib.sweep.duration_seconds").record(start.elapsed().as_secs_f64());

        let outcome = if result.is_ok() { "ok" } else { "failed" };
        metrics::counter!("toolcrib.sweep.runs", "outcome" => outcome).increment(1);
        result
    }

    /// Sweep every interval until `shutdown` flips or its sender drops
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = self.interval.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) => tracing::info!(?report, "Sweep finished"),
                    Err(err) => tracing::error!(error = %err, "Sweep failed; will retry next interval"),
                },
            }
        }
        tracing::info!("Sweeper stopped");
    }

    #[tracing::instrument(skip(self))]
    async fn sweep(&self) -> Result<SweepReport, AlertError> {
        let now = self.clock.now();
        let open = self
            .store
            .list_reservations(ReservationFilter::open())
            .await?;
        let overdue = detect_overdue(now, &open);

        let overdue_batch = self.generator.generate_all_overdue_alerts(&overdue).await;
        let condition_batch = self.generator.generate_condition_alerts().await?;

        let transient = overdue_batch
            .failed
            .iter()
            .chain(&condition_batch.failed)
            .map(|(_, err)| err)
            .find(|err| err.is_retryable());
        if let Some(err) = transient {
            return Err(err.clone());
        }

        let resolved = self.generator.resolve_stale_alerts(now).await?;

        Ok(SweepReport {
            overdue: overdue.len(),
            created: overdue_batch.created.len() + condition_batch.created.len(),
            deduplicated: overdue_batch.deduplicated + condition_batch.deduplicated,
            resolved: resolved.len(),
            failed: overdue_batch.failed.len() + condition_batch.failed.len(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::alerts::AlertPolicy;
    use crate::persistence::memory::{FaultPoint, InMemoryStore};
    use crate::persistence::{AlertFilter, AlertStore, RowWrites};
    use crate::types::{Availability, Employee, Reservation, ReservationId, ReservationStatus, Tool};
    use chrono::Duration as ChronoDuration;
    use toolcrib_testing::{FixedClock, epoch};

    fn config() -> SweepConfig {
        SweepConfig {
            interval_secs: 1,
            high_priority_after_days: 3,
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn seeded() -> (Arc<InMemoryStore>, Sweeper) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(epoch()));
        let mut tool = Tool::new("Borescope", "BS-3", "inspection");
        tool.availability = Availability::Reserved;
        let employee = Employee::new("Mara Ortiz", "E-42");
        store.insert_tool(tool.clone()).await.unwrap();
        store.insert_employee(employee.clone()).await.unwrap();
        store
            .insert_reservation(Reservation {
                id: ReservationId::new(),
                tool_id: tool.id,
                employee_id: employee.id,
                reserved_at: epoch() - ChronoDuration::days(2),
                due_at: epoch() - ChronoDuration::hours(1),
                returned_at: None,
                status: ReservationStatus::Open,
                condition_at_return: None,
            })
            .await
            .unwrap();

        let generator = AlertGenerator::new(store.clone(), store.clone(), clock.clone(), AlertPolicy::default());
        let sweeper = Sweeper::new(store.clone(), generator, clock, &config());
        (store, sweeper)
    }

    #[tokio::test]
    async fn repeated_sweeps_raise_one_alert() {
        let (store, sweeper) = seeded().await;

        let first = sweeper.run_once().await.unwrap();
        let second = sweeper.run_once().await.unwrap();

        assert_eq!(first.overdue, 1);
        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(store.list_alerts(AlertFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (store, sweeper) = seeded().await;
        store.fail_next(FaultPoint::Read, 1);

        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_error() {
        let (store, sweeper) = seeded().await;
        store.set_unavailable(true);

        let err = sweeper.run_once().await.unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_store, sweeper) = seeded().await;
        let (stop, stopped) = watch::channel(false);

        let handle = tokio::spawn(async move { sweeper.run(stopped).await });
        stop.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
