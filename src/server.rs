//! # Server Configuration
//!
//! Axum router and shared state for the admin surface. Every `/api` route
//! except the login check sits behind the bearer-token middleware.

use std::sync::Arc;

use axum::{
    Router, middleware,
    extract::FromRef,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::engine::SyncEngine;
use crate::handlers;
use crate::jobs::JobStore;
use crate::runlog::RunLogger;
use crate::store::KvStore;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub engine: Arc<SyncEngine>,
    pub jobs: JobStore,
    pub logger: RunLogger,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection, kv: Arc<dyn KvStore>) -> Self {
        let engine = Arc::new(SyncEngine::new(config.clone(), kv.clone()));
        Self {
            config,
            db,
            engine,
            jobs: JobStore::new(kv.clone()),
            logger: RunLogger::new(kv),
        }
    }
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/configs",
            get(handlers::configs::list_configs).post(handlers::configs::create_config),
        )
        .route(
            "/api/configs/{id}",
            axum::routing::put(handlers::configs::update_config)
                .delete(handlers::configs::delete_config),
        )
        .route(
            "/api/configs/{id}/schedule",
            get(handlers::configs::get_schedule).put(handlers::configs::update_schedule),
        )
        .route("/api/sync", post(handlers::sync::run_all))
        .route("/api/sync/{id}", post(handlers::sync::trigger_sync))
        .route(
            "/api/logs/{job_id}",
            get(handlers::logs::get_logs).delete(handlers::logs::delete_logs),
        )
        .route("/api/sheets/test", post(handlers::sheets_diag::test_sheet))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/api/auth", post(handlers::login))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given state
pub async fn run_server(state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %profile, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::login,
        crate::handlers::configs::list_configs,
        crate::handlers::configs::create_config,
        crate::handlers::configs::update_config,
        crate::handlers::configs::delete_config,
        crate::handlers::configs::get_schedule,
        crate::handlers::configs::update_schedule,
        crate::handlers::sync::trigger_sync,
        crate::handlers::sync::run_all,
        crate::handlers::logs::get_logs,
        crate::handlers::logs::delete_logs,
        crate::handlers::sheets_diag::test_sheet,
    ),
    components(
        schemas(
            crate::handlers::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::AuthRequest,
            crate::handlers::AuthResponse,
            crate::handlers::configs::MutationResponse,
            crate::handlers::configs::CreateJobResponse,
            crate::handlers::configs::SchedulePayload,
            crate::handlers::sync::SyncRequest,
            crate::handlers::sync::SyncResponse,
            crate::handlers::sync::SweepResponse,
            crate::handlers::sync::SweepJobResult,
            crate::handlers::logs::LogsResponse,
            crate::handlers::logs::ClearResponse,
            crate::handlers::sheets_diag::SheetTestRequest,
            crate::handlers::sheets_diag::SheetTestResponse,
            crate::jobs::JobConfig,
            crate::runlog::LogEntry,
            crate::runlog::RunInfo,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Mirrorsync API",
        description = "Admin API for the warehouse mirror sync service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
