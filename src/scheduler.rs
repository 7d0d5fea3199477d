//! # Cron Dispatcher
//!
//! Background task that fires once per minute, matches each enabled job's
//! cron expression against the current minute, and drives due runs to
//! completion batch by batch. Jobs run sequentially, with sheet-to-warehouse
//! jobs strictly before warehouse-to-sink jobs in the same sweep so
//! dependent mirrors see fresh data.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use metrics::{counter, histogram};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::engine::SyncEngine;
use crate::jobs::{JobConfig, JobKind, JobStore};
use crate::store::KvStore;

/// Upper bound on batches per run; a backstop against a cursor that never
/// advances.
const MAX_BATCHES_PER_RUN: u32 = 10_000;

/// Background scheduler service.
pub struct CronDispatcher {
    config: Arc<AppConfig>,
    engine: Arc<SyncEngine>,
    jobs: JobStore,
    kv: Arc<dyn KvStore>,
}

impl CronDispatcher {
    pub fn new(config: Arc<AppConfig>, engine: Arc<SyncEngine>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            engine,
            jobs: JobStore::new(kv.clone()),
            kv,
        }
    }

    /// Run the dispatcher loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting cron dispatcher");
        let tick_interval = TokioDuration::from_secs(self.config.scheduler.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cron dispatcher shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "Dispatcher tick failed");
                    }
                    histogram!("sync_dispatcher_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Cron dispatcher stopped");
    }

    /// One dispatcher sweep: collect due jobs, order them by dependency,
    /// and run each to completion.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), crate::engine::SyncError> {
        // Lazy TTL garbage collection rides along with the sweep.
        if let Ok(purged) = self.kv.purge_expired().await
            && purged > 0
        {
            debug!(purged, "Purged expired key/value entries");
        }

        let jobs = self.jobs.list().await?;
        let mut due: Vec<JobConfig> = jobs
            .into_iter()
            .filter(|job| job.enabled)
            .filter(|job| {
                job.cron_schedule
                    .as_deref()
                    .is_some_and(|expression| cron_matches(expression, now))
            })
            .collect();

        if due.is_empty() {
            return Ok(());
        }

        // Sheet imports feed warehouse tables that downstream mirror jobs
        // read in the same sweep.
        due.sort_by_key(|job| match job.kind {
            JobKind::SheetToWarehouse => 0,
            JobKind::WarehouseToSink => 1,
        });

        info!(due = due.len(), "Dispatching scheduled jobs");
        for job in due {
            counter!("sync_scheduled_runs_total").increment(1);
            if let Err(err) = self.run_to_completion(&job).await {
                // The engine already recorded the failure on the job; the
                // sweep continues with the remaining jobs.
                error!(job_id = %job.id, kind = err.kind(), error = %err, "Scheduled run failed");
            }
        }

        Ok(())
    }

    /// Drives one run through its batch chain until the engine reports no
    /// more work.
    async fn run_to_completion(&self, job: &JobConfig) -> Result<(), crate::engine::SyncError> {
        let mut run_id: Option<String> = None;
        let mut batch_number = 1u32;

        loop {
            let result = self
                .engine
                .run_batch(job, run_id.clone(), batch_number)
                .await?;

            if !result.has_more {
                return Ok(());
            }
            if batch_number >= MAX_BATCHES_PER_RUN {
                warn!(job_id = %job.id, "Run exceeded batch cap; abandoning chain");
                return Ok(());
            }

            run_id = Some(result.run_id);
            batch_number = result.next_batch.unwrap_or(batch_number + 1);
        }
    }
}

/// Returns whether a 5-field cron expression fires at the given minute.
/// Invalid expressions never match (and are reported once per sweep).
pub fn cron_matches(expression: &str, now: DateTime<Utc>) -> bool {
    let Some(schedule) = parse_cron_expression(expression) else {
        warn!(expression, "Invalid cron expression; skipping job");
        return false;
    };

    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    schedule.includes(minute)
}

/// Returns whether an expression parses as a 5-field (or 6-field) cron.
pub fn is_valid_cron(expression: &str) -> bool {
    parse_cron_expression(expression).is_some()
}

/// Parses a cron expression, normalizing 5-field syntax to 6-field with
/// a zero seconds column.
fn parse_cron_expression(expression: &str) -> Option<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        _ => return None,
    };

    Schedule::from_str(&normalized).ok()
}
