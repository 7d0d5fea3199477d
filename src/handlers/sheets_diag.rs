//! Spreadsheet connectivity diagnostic handler.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::server::AppState;
use crate::sheets::{parse_spreadsheet_id, row_range};

/// Diagnostic request: the sheet to probe.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SheetTestRequest {
    pub url: String,
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

/// Diagnostic response: the header row as read.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SheetTestResponse {
    pub success: bool,
    pub spreadsheet_id: String,
    pub headers: Vec<String>,
}

/// Resolves a spreadsheet URL and reads its header row
#[utoipa::path(
    post,
    path = "/api/sheets/test",
    security(("bearer_auth" = [])),
    request_body = SheetTestRequest,
    responses(
        (status = 200, description = "Sheet reachable", body = SheetTestResponse),
        (status = 400, description = "Malformed spreadsheet URL", body = crate::error::ApiError),
        (status = 502, description = "Sheet unreachable", body = crate::error::ApiError)
    ),
    tag = "sheets"
)]
pub async fn test_sheet(
    State(state): State<AppState>,
    Json(request): Json<SheetTestRequest>,
) -> Result<Json<SheetTestResponse>, AppError> {
    let spreadsheet_id = parse_spreadsheet_id(&request.url)?;

    let sheets = state.engine.sheets_client().await?;
    let rows = sheets
        .read_range(&spreadsheet_id, &row_range(&request.sheet_name, 1, 1))
        .await?;

    let headers = rows
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|cell| match cell {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        })
        .collect();

    Ok(Json(SheetTestResponse {
        success: true,
        spreadsheet_id,
        headers,
    }))
}
