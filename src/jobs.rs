//! Job configuration model and store.
//!
//! Jobs are persisted as `job:{id}` documents in the key/value store and
//! mutated by the admin surface; the engine only touches the last-run
//! bookkeeping fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::SyncError;
use crate::store::{KvStore, get_json, job_key, put_json};

/// Engine variant a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum JobKind {
    #[serde(rename = "bq-to-supabase")]
    WarehouseToSink,
    #[serde(rename = "sheets-to-bq")]
    SheetToWarehouse,
}

impl Default for JobKind {
    fn default() -> Self {
        JobKind::WarehouseToSink
    }
}

/// Tie policy for DATE-typed incremental columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnDateTie {
    /// Strict `>`: rows sharing the recorded last-sync value are skipped.
    Skip,
    /// `>=`: rows sharing the recorded value are re-read; idempotent
    /// because upserts conflict on the declared key.
    Reprocess,
}

impl Default for OnDateTie {
    fn default() -> Self {
        OnDateTie::Skip
    }
}

impl OnDateTie {
    pub fn operator(&self) -> &'static str {
        match self {
            OnDateTie::Skip => ">",
            OnDateTie::Reprocess => ">=",
        }
    }
}

/// Warehouse-side configuration of a job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseSection {
    pub project_id: String,
    pub dataset: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_column: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force_string_fields: Vec<String>,
    #[serde(default)]
    pub on_date_tie: OnDateTie,
}

/// Sink-side configuration of a job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkSection {
    pub table: String,
    pub upsert_columns: Vec<String>,
}

/// Spreadsheet-side configuration of a sheet-to-warehouse job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SheetSection {
    /// Sharing URL of the spreadsheet.
    pub url: String,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    /// When true every batch appends; when false batch 1 truncates.
    #[serde(default)]
    pub append: bool,
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

/// Terminal status of a job's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

/// A configured synchronization job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: JobKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bigquery: Option<WarehouseSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase: Option<SinkSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheets: Option<SheetSection>,

    // Engine-owned last-run bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    /// Validates the section layout required by the job's variant.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self.kind {
            JobKind::WarehouseToSink => {
                let warehouse = self
                    .bigquery
                    .as_ref()
                    .ok_or_else(|| SyncError::config("bigquery section is required"))?;
                if warehouse.project_id.is_empty()
                    || warehouse.dataset.is_empty()
                    || warehouse.table.is_empty()
                {
                    return Err(SyncError::config(
                        "bigquery section needs projectId, dataset, and table",
                    ));
                }

                let sink = self
                    .supabase
                    .as_ref()
                    .ok_or_else(|| SyncError::config("supabase section is required"))?;
                if sink.table.is_empty() {
                    return Err(SyncError::config("supabase.table must be set"));
                }
                if sink.upsert_columns.is_empty() {
                    return Err(SyncError::config("supabase.upsertColumns must not be empty"));
                }
            }
            JobKind::SheetToWarehouse => {
                let sheets = self
                    .sheets
                    .as_ref()
                    .ok_or_else(|| SyncError::config("sheets section is required"))?;
                crate::sheets::parse_spreadsheet_id(&sheets.url)?;

                let destination = self
                    .bigquery
                    .as_ref()
                    .ok_or_else(|| SyncError::config("bigquery destination section is required"))?;
                if destination.project_id.is_empty()
                    || destination.dataset.is_empty()
                    || destination.table.is_empty()
                {
                    return Err(SyncError::config(
                        "bigquery destination needs projectId, dataset, and table",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Store for job configuration documents.
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn KvStore>,
}

impl JobStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Lists all configured jobs.
    pub async fn list(&self) -> Result<Vec<JobConfig>, SyncError> {
        let keys = self.kv.list_keys("job:").await?;

        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = get_json::<JobConfig>(self.kv.as_ref(), &key).await? {
                jobs.push(job);
            }
        }

        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    /// Fetches one job by id.
    pub async fn get(&self, id: &str) -> Result<Option<JobConfig>, SyncError> {
        Ok(get_json(self.kv.as_ref(), &job_key(id)).await?)
    }

    /// Persists a job, assigning an id when absent. Returns the saved job.
    pub async fn save(&self, mut job: JobConfig) -> Result<JobConfig, SyncError> {
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        put_json(self.kv.as_ref(), &job_key(&job.id), &job, None).await?;
        Ok(job)
    }

    /// Deletes a job. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        Ok(self.kv.delete(&job_key(id)).await?)
    }
}
