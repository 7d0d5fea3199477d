//! Job configuration CRUD and schedule management handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, not_found, validation_error};
use crate::jobs::JobConfig;
use crate::scheduler::is_valid_cron;
use crate::server::AppState;

/// Mutation acknowledgement.
#[derive(Debug, Serialize, ToSchema)]
pub struct MutationResponse {
    pub success: bool,
}

/// Response for job creation, echoing the stored job.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateJobResponse {
    pub success: bool,
    pub job: JobConfig,
}

/// Lists all configured jobs
#[utoipa::path(
    get,
    path = "/api/configs",
    security(("bearer_auth" = [])),
    responses((status = 200, description = "All configured jobs", body = [JobConfig])),
    tag = "configs"
)]
pub async fn list_configs(State(state): State<AppState>) -> Result<Json<Vec<JobConfig>>, AppError> {
    Ok(Json(state.jobs.list().await?))
}

/// Creates a job, assigning an id when absent
#[utoipa::path(
    post,
    path = "/api/configs",
    security(("bearer_auth" = [])),
    request_body = JobConfig,
    responses(
        (status = 200, description = "Job stored", body = CreateJobResponse),
        (status = 400, description = "Invalid job configuration", body = crate::error::ApiError)
    ),
    tag = "configs"
)]
pub async fn create_config(
    State(state): State<AppState>,
    Json(job): Json<JobConfig>,
) -> Result<Json<CreateJobResponse>, AppError> {
    job.validate()?;
    let job = state.jobs.save(job).await?;
    Ok(Json(CreateJobResponse { success: true, job }))
}

/// Replaces a job configuration
#[utoipa::path(
    put,
    path = "/api/configs/{id}",
    security(("bearer_auth" = [])),
    request_body = JobConfig,
    responses(
        (status = 200, description = "Job updated", body = MutationResponse),
        (status = 404, description = "Unknown job", body = crate::error::ApiError)
    ),
    tag = "configs"
)]
pub async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut job): Json<JobConfig>,
) -> Result<Json<MutationResponse>, AppError> {
    if state.jobs.get(&id).await?.is_none() {
        return Err(not_found(&format!("job {id} does not exist")).into());
    }

    job.id = id;
    job.validate()?;
    state.jobs.save(job).await?;
    Ok(Json(MutationResponse { success: true }))
}

/// Deletes a job configuration
#[utoipa::path(
    delete,
    path = "/api/configs/{id}",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Job deleted", body = MutationResponse),
        (status = 404, description = "Unknown job", body = crate::error::ApiError)
    ),
    tag = "configs"
)]
pub async fn delete_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MutationResponse>, AppError> {
    if !state.jobs.delete(&id).await? {
        return Err(not_found(&format!("job {id} does not exist")).into());
    }
    Ok(Json(MutationResponse { success: true }))
}

/// Cron schedule payload.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePayload {
    pub cron_schedule: Option<String>,
}

/// Reads a job's cron schedule
#[utoipa::path(
    get,
    path = "/api/configs/{id}/schedule",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Current schedule", body = SchedulePayload),
        (status = 404, description = "Unknown job", body = crate::error::ApiError)
    ),
    tag = "configs"
)]
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SchedulePayload>, AppError> {
    let job = state
        .jobs
        .get(&id)
        .await?
        .ok_or_else(|| AppError::from(not_found(&format!("job {id} does not exist"))))?;

    Ok(Json(SchedulePayload {
        cron_schedule: job.cron_schedule,
    }))
}

/// Updates a job's cron schedule
#[utoipa::path(
    put,
    path = "/api/configs/{id}/schedule",
    security(("bearer_auth" = [])),
    request_body = SchedulePayload,
    responses(
        (status = 200, description = "Schedule updated", body = MutationResponse),
        (status = 400, description = "Invalid cron expression", body = crate::error::ApiError),
        (status = 404, description = "Unknown job", body = crate::error::ApiError)
    ),
    tag = "configs"
)]
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SchedulePayload>,
) -> Result<Json<MutationResponse>, AppError> {
    let mut job = state
        .jobs
        .get(&id)
        .await?
        .ok_or_else(|| AppError::from(not_found(&format!("job {id} does not exist"))))?;

    if let Some(expression) = &payload.cron_schedule
        && !is_valid_cron(expression)
    {
        return Err(validation_error(
            "Invalid cron expression",
            serde_json::json!({ "cronSchedule": "expected a 5-field cron expression" }),
        )
        .into());
    }

    job.cron_schedule = payload.cron_schedule;
    state.jobs.save(job).await?;
    Ok(Json(MutationResponse { success: true }))
}
