//! Per-run resumption state.
//!
//! Run state exists exactly while a run is mid-flight: it is created on
//! batch 1, rewritten on every non-terminal batch, and deleted on the
//! terminal batch. A 24-hour TTL backstops orphaned runs. The two engine
//! variants persist different shapes and never share fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::engine::SyncError;
use crate::engine::cursor::CursorTuple;
use crate::schema::Field;
use crate::store::{KvStore, TTL_RUN_STATE, get_json, put_json, sync_state_key};

/// Resumption record for a warehouse-to-sink run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Last-sync value read from the sink at run start (source-typed).
    pub last_sync_value: Option<JsonValue>,
    /// Source schema snapshot, immutable after batch 1.
    pub source_schema: Vec<Field>,
    /// Rows processed so far across all batches of the run.
    pub rows_processed: u64,
    pub started_at: DateTime<Utc>,
    /// Set once schema reconciliation completed on batch 1.
    pub schema_sync_done: bool,
    /// Cursor carried from the previous batch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorTuple>,
}

/// Resumption record for a sheet-to-warehouse run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRunState {
    /// Sanitized headers read from row 1.
    pub headers: Vec<String>,
    /// Whether the destination table had to be created for this run.
    pub is_new_table: bool,
    /// First sheet row (1-based) the next batch reads.
    pub next_row: u64,
    pub rows_processed: u64,
    pub started_at: DateTime<Utc>,
    pub schema_sync_done: bool,
}

/// Store for per-run resumption state.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn load(&self, job_id: &str, run_id: &str) -> Result<Option<RunState>, SyncError> {
        Ok(get_json(self.kv.as_ref(), &sync_state_key(job_id, run_id)).await?)
    }

    pub async fn save(
        &self,
        job_id: &str,
        run_id: &str,
        state: &RunState,
    ) -> Result<(), SyncError> {
        put_json(
            self.kv.as_ref(),
            &sync_state_key(job_id, run_id),
            state,
            Some(TTL_RUN_STATE),
        )
        .await?;
        Ok(())
    }

    pub async fn load_sheet(
        &self,
        job_id: &str,
        run_id: &str,
    ) -> Result<Option<SheetRunState>, SyncError> {
        Ok(get_json(self.kv.as_ref(), &sync_state_key(job_id, run_id)).await?)
    }

    pub async fn save_sheet(
        &self,
        job_id: &str,
        run_id: &str,
        state: &SheetRunState,
    ) -> Result<(), SyncError> {
        put_json(
            self.kv.as_ref(),
            &sync_state_key(job_id, run_id),
            state,
            Some(TTL_RUN_STATE),
        )
        .await?;
        Ok(())
    }

    /// Deletes the state for a terminal batch.
    pub async fn clear(&self, job_id: &str, run_id: &str) -> Result<(), SyncError> {
        self.kv.delete(&sync_state_key(job_id, run_id)).await?;
        Ok(())
    }
}
