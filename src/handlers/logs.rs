//! Run log read and clear handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::runlog::{LogEntry, RunInfo};
use crate::server::AppState;

/// Query parameters for log reads.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    /// Run to read; defaults to the job's latest run.
    pub run_id: Option<String>,
    /// Maximum entries to return.
    pub limit: Option<usize>,
}

/// Response for the log read endpoint.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    /// Whether the job exists.
    pub exists: bool,
    pub runs: Vec<RunInfo>,
    pub logs: Vec<LogEntry>,
}

/// Reads the run index and one run's log entries
#[utoipa::path(
    get,
    path = "/api/logs/{job_id}",
    security(("bearer_auth" = [])),
    params(
        ("run_id" = Option<String>, Query, description = "Run to read; defaults to latest"),
        ("limit" = Option<usize>, Query, description = "Maximum entries to return")
    ),
    responses((status = 200, description = "Run index and log entries", body = LogsResponse)),
    tag = "logs"
)]
pub async fn get_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, AppError> {
    let exists = state.jobs.get(&job_id).await?.is_some();
    let runs = state.logger.list_runs(&job_id).await?;

    let run_id = match query.run_id {
        Some(run_id) => Some(run_id),
        None => state
            .logger
            .latest_run(&job_id)
            .await?
            .map(|latest| latest.run_id),
    };

    let logs = match run_id {
        Some(run_id) => state.logger.read(&job_id, &run_id, query.limit).await?,
        None => Vec::new(),
    };

    Ok(Json(LogsResponse { exists, runs, logs }))
}

/// Query parameters for log clears.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearQuery {
    /// Run to clear; absent clears all logs for the job.
    pub run_id: Option<String>,
}

/// Response for the log clear endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ClearResponse {
    pub success: bool,
    pub deleted: u64,
}

/// Clears one run's log or every log for the job
#[utoipa::path(
    delete,
    path = "/api/logs/{job_id}",
    security(("bearer_auth" = [])),
    params(("run_id" = Option<String>, Query, description = "Run to clear; absent clears all")),
    responses((status = 200, description = "Logs cleared", body = ClearResponse)),
    tag = "logs"
)]
pub async fn delete_logs(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ClearResponse>, AppError> {
    let deleted = state
        .logger
        .clear(&job_id, query.run_id.as_deref())
        .await?;

    Ok(Json(ClearResponse {
        success: true,
        deleted,
    }))
}
