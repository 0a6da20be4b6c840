//! Fixed-interval driver for the renewal and history jobs.

use crate::clock::Clock;
use crate::engine::{HistorySnapshotter, PeriodGenerator, PeriodTransitionEngine, TickReport};
use crate::services::metrics::record_job_tick;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A unit of periodic work. Jobs keep no state between ticks.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError>;
}

#[async_trait]
impl Job for PeriodGenerator {
    fn name(&self) -> &'static str {
        "period_generator"
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        PeriodGenerator::tick(self, now).await
    }
}

#[async_trait]
impl Job for PeriodTransitionEngine {
    fn name(&self) -> &'static str {
        "period_transition"
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        PeriodTransitionEngine::tick(self, now).await
    }
}

#[async_trait]
impl Job for HistorySnapshotter {
    fn name(&self) -> &'static str {
        "history_snapshotter"
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        HistorySnapshotter::tick(self, now).await
    }
}

/// Runs registered jobs in registration order on every tick.
pub struct Scheduler {
    jobs: Vec<Arc<dyn Job>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            clock,
            interval,
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>) -> &mut Self {
        tracing::info!(job = job.name(), "Job registered");
        self.jobs.push(job);
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    /// Run every job once at the clock's current time. A failing job is logged
    /// and does not stop the ones after it.
    pub async fn tick_once(&self) -> Vec<(&'static str, Result<TickReport, AppError>)> {
        let now = self.clock.now();
        let mut results = Vec::with_capacity(self.jobs.len());

        for job in &self.jobs {
            let start = Instant::now();
            let result = job.tick(now).await;
            let elapsed = start.elapsed().as_secs_f64();

            match &result {
                Ok(report) => {
                    record_job_tick(job.name(), "ok", elapsed);
                    if report.selected > 0 {
                        tracing::info!(
                            job = job.name(),
                            selected = report.selected,
                            changed = report.changed,
                            skipped = report.skipped,
                            failed = report.failed,
                            duration_ms = (elapsed * 1000.0) as u64,
                            "Job tick completed"
                        );
                    }
                }
                Err(e) => {
                    record_job_tick(job.name(), "error", elapsed);
                    tracing::error!(job = job.name(), error = %e, "Job tick failed");
                }
            }
            results.push((job.name(), result));
        }

        results
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            jobs = ?self.job_names(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
            }
        }
    }
}
