//! # Admin API Handlers
//!
//! Handlers for the bearer-guarded admin surface: job CRUD, run-and-resume,
//! log access, schedule management, and the sheet connectivity diagnostic.

pub mod configs;
pub mod logs;
pub mod sheets_diag;
pub mod sync;

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::validate_key;
use crate::error::ApiError;
use crate::server::AppState;

/// Service identification payload for the root endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Root endpoint
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service information", body = ServiceInfo)),
    tag = "meta"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Health response payload.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

/// Health endpoint covering the service and its database
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "meta"
)]
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match crate::db::health_check(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                database: "ok",
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                database: "unreachable",
            }),
        ),
    }
}

/// Login request body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthRequest {
    pub key: String,
}

/// Login response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub success: bool,
}

/// Validates the admin key presented by the dashboard
#[utoipa::path(
    post,
    path = "/api/auth",
    request_body = AuthRequest,
    responses(
        (status = 200, description = "Key accepted", body = AuthResponse),
        (status = 401, description = "Key rejected", body = ApiError)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    validate_key(&state.config, &request.key)?;
    Ok(Json(AuthResponse { success: true }))
}
