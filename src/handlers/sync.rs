//! Run-and-resume handlers.
//!
//! `POST /api/sync/{id}` executes exactly one batch and reports whether the
//! caller should schedule another; `POST /api/sync` sweeps every enabled
//! job to completion in dependency order.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, not_found};
use crate::jobs::JobKind;
use crate::server::AppState;

/// Request body for run-and-resume.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Run to continue; absent for batch 1.
    pub run_id: Option<String>,
    /// Batch number to execute; defaults to 1.
    pub batch_number: Option<u32>,
}

/// Response for one executed batch.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub run_id: String,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<u32>,
    pub rows_processed: u64,
    pub rows_deleted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

/// Executes one batch of a run for a job
#[utoipa::path(
    post,
    path = "/api/sync/{id}",
    security(("bearer_auth" = [])),
    request_body = SyncRequest,
    responses(
        (status = 200, description = "Batch executed", body = SyncResponse),
        (status = 400, description = "Invalid configuration", body = crate::error::ApiError),
        (status = 404, description = "Unknown job", body = crate::error::ApiError),
        (status = 502, description = "Source or sink failure", body = crate::error::ApiError)
    ),
    tag = "sync"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let job = state
        .jobs
        .get(&id)
        .await?
        .ok_or_else(|| AppError::from(not_found(&format!("job {id} does not exist"))))?;

    let result = state
        .engine
        .run_batch(&job, request.run_id, request.batch_number.unwrap_or(1))
        .await?;

    Ok(Json(SyncResponse {
        success: true,
        run_id: result.run_id,
        has_more: result.has_more,
        next_batch: result.next_batch,
        rows_processed: result.rows_processed,
        rows_deleted: result.rows_deleted,
        stats: result.summary,
    }))
}

/// Outcome of one job in a run-all sweep.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepJobResult {
    pub job_id: String,
    pub name: String,
    pub success: bool,
    pub rows_processed: u64,
    pub rows_deleted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for the run-all endpoint.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub success: bool,
    pub results: Vec<SweepJobResult>,
}

/// Runs every enabled job to completion, sheet imports first
#[utoipa::path(
    post,
    path = "/api/sync",
    security(("bearer_auth" = [])),
    responses((status = 200, description = "Sweep finished", body = SweepResponse)),
    tag = "sync"
)]
pub async fn run_all(State(state): State<AppState>) -> Result<Json<SweepResponse>, AppError> {
    let mut jobs: Vec<_> = state
        .jobs
        .list()
        .await?
        .into_iter()
        .filter(|job| job.enabled)
        .collect();
    jobs.sort_by_key(|job| match job.kind {
        JobKind::SheetToWarehouse => 0,
        JobKind::WarehouseToSink => 1,
    });

    let mut results = Vec::with_capacity(jobs.len());
    for job in jobs {
        let mut run_id: Option<String> = None;
        let mut batch_number = 1u32;
        let mut rows_processed = 0u64;
        let mut rows_deleted = 0u64;

        let outcome = loop {
            match state.engine.run_batch(&job, run_id.clone(), batch_number).await {
                Ok(result) => {
                    rows_processed += result.rows_processed;
                    rows_deleted += result.rows_deleted;
                    if !result.has_more {
                        break Ok(());
                    }
                    run_id = Some(result.run_id);
                    batch_number = result.next_batch.unwrap_or(batch_number + 1);
                }
                Err(err) => break Err(err),
            }
        };

        results.push(SweepJobResult {
            job_id: job.id.clone(),
            name: job.name.clone(),
            success: outcome.is_ok(),
            rows_processed,
            rows_deleted,
            error: outcome.err().map(|err| err.to_string()),
        });
    }

    Ok(Json(SweepResponse {
        success: true,
        results,
    }))
}
