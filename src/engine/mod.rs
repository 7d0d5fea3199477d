//! # Sync Engine
//!
//! The state machine that drives a run: schema reconciliation, cursor-based
//! incremental extraction, batched upserts, delete detection with safety
//! gates, and cross-invocation continuation. One call to
//! [`SyncEngine::run_batch`] executes exactly one batch; when more source
//! rows remain the result says so and the caller owns the next invocation.

pub mod cursor;
mod deletes;
mod error;
mod sheet_sync;
mod warehouse_sync;

pub use error::SyncError;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::jobs::{JobConfig, JobKind, JobStore, RunStatus};
use crate::runlog::{LogLevel, RunLogger};
use crate::sheets::SheetsClient;
use crate::sink::SinkClient;
use crate::state::StateStore;
use crate::store::KvStore;
use crate::warehouse::{ServiceAccountKey, TokenProvider, WarehouseClient};

/// Rows fetched from the source per batch.
pub const FETCH_LIMIT: usize = 5000;

/// Rows upserted to the sink per sub-batch.
pub const UPSERT_SUB_BATCH: usize = 2500;

/// Sink rows read per page during delete detection.
pub const DELETE_SCAN_PAGE: usize = 10_000;

/// Outcome of one batch of a run.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub run_id: String,
    pub has_more: bool,
    /// Batch number the caller should invoke next, when `has_more`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<u32>,
    /// Rows processed by this batch.
    pub rows_processed: u64,
    /// Rows removed by delete detection (terminal batch only).
    pub rows_deleted: u64,
    /// Success summary (terminal batch only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Orchestrates runs for both job variants.
pub struct SyncEngine {
    config: Arc<AppConfig>,
    http: reqwest::Client,
    jobs: JobStore,
    logger: RunLogger,
    state: StateStore,
    tokens: OnceCell<Arc<TokenProvider>>,
}

impl SyncEngine {
    pub fn new(config: Arc<AppConfig>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            jobs: JobStore::new(kv.clone()),
            logger: RunLogger::new(kv.clone()),
            state: StateStore::new(kv),
            tokens: OnceCell::new(),
        }
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Executes one batch of a run, creating the run when `run_id` is
    /// absent. Any error ends the run, records it on the job, and surfaces
    /// to the caller.
    #[instrument(skip(self, job), fields(job_id = %job.id, batch = batch_number))]
    pub async fn run_batch(
        &self,
        job: &JobConfig,
        run_id: Option<String>,
        batch_number: u32,
    ) -> Result<BatchResult, SyncError> {
        job.validate()?;

        let batch_number = batch_number.max(1);
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline =
            Instant::now() + Duration::from_millis(self.config.engine.batch_deadline_ms);

        if batch_number == 1 {
            self.logger.start_run(&job.id, &run_id).await?;
            self.mark_job_running(&job.id).await?;
        }

        let started = Instant::now();
        let result = match job.kind {
            JobKind::WarehouseToSink => {
                warehouse_sync::run_batch(self, job, &run_id, batch_number, deadline).await
            }
            JobKind::SheetToWarehouse => {
                sheet_sync::run_batch(self, job, &run_id, batch_number, deadline).await
            }
        };
        histogram!("sync_batch_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(outcome) => {
                counter!("sync_rows_processed_total").increment(outcome.rows_processed);
                if !outcome.has_more {
                    self.finish_success(job, &run_id, &outcome).await?;
                }
                Ok(outcome)
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err, "Batch failed");
                self.finish_error(job, &run_id, &err).await;
                Err(err)
            }
        }
    }

    async fn finish_success(
        &self,
        job: &JobConfig,
        run_id: &str,
        outcome: &BatchResult,
    ) -> Result<(), SyncError> {
        let summary = outcome.summary.clone().unwrap_or_default();

        self.logger
            .log(
                &job.id,
                &job.name,
                run_id,
                LogLevel::Success,
                "success",
                &summary,
                Some(serde_json::json!({
                    "rowsDeleted": outcome.rows_deleted,
                })),
            )
            .await?;
        self.logger
            .end_run(&job.id, run_id, RunStatus::Success)
            .await?;
        self.state.clear(&job.id, run_id).await?;

        if let Some(mut stored) = self.jobs.get(&job.id).await? {
            stored.last_status = Some(RunStatus::Success);
            stored.last_error = None;
            stored.last_summary = Some(summary.clone());
            self.jobs.save(stored).await?;
        }

        info!(run_id, summary = %summary, "Run completed");
        Ok(())
    }

    async fn finish_error(&self, job: &JobConfig, run_id: &str, err: &SyncError) {
        let _ = self
            .logger
            .log(
                &job.id,
                &job.name,
                run_id,
                LogLevel::Error,
                "error",
                &err.to_string(),
                Some(serde_json::json!({ "kind": err.kind() })),
            )
            .await;
        let _ = self.logger.end_run(&job.id, run_id, RunStatus::Error).await;
        let _ = self.state.clear(&job.id, run_id).await;

        if let Ok(Some(mut stored)) = self.jobs.get(&job.id).await {
            stored.last_status = Some(RunStatus::Error);
            stored.last_error = Some(err.to_string());
            let _ = self.jobs.save(stored).await;
        }
    }

    async fn mark_job_running(&self, job_id: &str) -> Result<(), SyncError> {
        if let Some(mut stored) = self.jobs.get(job_id).await? {
            stored.last_status = Some(RunStatus::Running);
            stored.last_run_at = Some(Utc::now());
            self.jobs.save(stored).await?;
        }
        Ok(())
    }

    async fn token_provider(&self) -> Result<Arc<TokenProvider>, SyncError> {
        self.tokens
            .get_or_try_init(|| async {
                let key = ServiceAccountKey::load(&self.config.google_service_account)?;
                Ok(Arc::new(TokenProvider::new(self.http.clone(), key)))
            })
            .await
            .cloned()
    }

    pub(crate) async fn warehouse_client(&self) -> Result<WarehouseClient, SyncError> {
        Ok(WarehouseClient::new(
            self.http.clone(),
            self.config.warehouse_base_url.clone(),
            self.token_provider().await?,
        ))
    }

    pub(crate) async fn sheets_client(&self) -> Result<SheetsClient, SyncError> {
        Ok(SheetsClient::new(
            self.http.clone(),
            self.config.sheets_base_url.clone(),
            self.token_provider().await?,
        ))
    }

    pub(crate) fn sink_client(&self) -> Result<SinkClient, SyncError> {
        if self.config.sink_url.is_empty() {
            return Err(SyncError::config("sink URL is not configured"));
        }
        Ok(SinkClient::new(
            self.http.clone(),
            self.config.sink_url.clone(),
            self.config.sink_service_key.clone(),
        ))
    }

    pub(crate) fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub(crate) fn engine_config(&self) -> &crate::config::EngineConfig {
        &self.config.engine
    }

    pub(crate) async fn log(
        &self,
        job: &JobConfig,
        run_id: &str,
        level: LogLevel,
        phase: &str,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), SyncError> {
        self.logger
            .log(&job.id, &job.name, run_id, level, phase, message, metadata)
            .await
    }
}

/// Formats the success summary for a terminal batch.
pub(crate) fn format_summary(
    rows_synced: u64,
    rows_deleted: u64,
    started_at: DateTime<Utc>,
) -> String {
    let elapsed = (Utc::now() - started_at).num_seconds().max(0);
    let minutes = elapsed / 60;
    let seconds = elapsed % 60;

    if rows_deleted > 0 {
        format!("{rows_synced} rows synced, {rows_deleted} deleted in {minutes}m {seconds}s")
    } else {
        format!("{rows_synced} rows synced in {minutes}m {seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_mentions_deletes_only_when_present() {
        let now = Utc::now();
        assert!(format_summary(2, 0, now).starts_with("2 rows synced in"));
        assert!(format_summary(10, 3, now).starts_with("10 rows synced, 3 deleted in"));
    }
}
