//! Sheet-to-warehouse batch execution.
//!
//! Reads the header row once, sanitizes it into column names, and streams
//! page-sized row ranges into warehouse load jobs. The first import of a
//! new table infers a schema from the data; existing tables evolve through
//! nullable string columns. Pagination is by row offset; there is no
//! delete phase.

use std::sync::LazyLock;

use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Value as JsonValue, json};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{BatchResult, FETCH_LIMIT, SyncEngine, format_summary};
use crate::engine::SyncError;
use crate::jobs::JobConfig;
use crate::runlog::LogLevel;
use crate::schema::{Field, FieldType};
use crate::sheets::{parse_spreadsheet_id, row_range};
use crate::state::SheetRunState;
use crate::warehouse::LoadMode;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?(Z|[+-]\d{2}:?\d{2})?$").unwrap()
});
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap());
static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+$").unwrap());

pub(super) async fn run_batch(
    engine: &SyncEngine,
    job: &JobConfig,
    run_id: &str,
    batch_number: u32,
    _deadline: Instant,
) -> Result<BatchResult, SyncError> {
    let sheet_section = job.sheets.as_ref().expect("validated");
    let destination = job.bigquery.as_ref().expect("validated");

    let sheets = engine.sheets_client().await?;
    let warehouse = engine.warehouse_client().await?;
    let spreadsheet_id = parse_spreadsheet_id(&sheet_section.url)?;

    let mut state = if batch_number == 1 {
        let header_rows = sheets
            .read_range(&spreadsheet_id, &row_range(&sheet_section.sheet_name, 1, 1))
            .await?;
        let raw_headers = header_rows
            .into_iter()
            .next()
            .filter(|row| !row.is_empty())
            .ok_or_else(|| SyncError::config("sheet has no header row"))?;

        let headers: Vec<String> = raw_headers
            .iter()
            .enumerate()
            .map(|(index, cell)| sanitize_header(cell_text(cell).as_deref().unwrap_or(""), index))
            .collect();

        let is_new_table = match warehouse
            .get_metadata(&destination.project_id, &destination.dataset, &destination.table)
            .await
        {
            Ok(_) => false,
            Err(SyncError::NotFound { .. }) => true,
            Err(other) => return Err(other),
        };

        let state = SheetRunState {
            headers,
            is_new_table,
            next_row: 2,
            rows_processed: 0,
            started_at: Utc::now(),
            schema_sync_done: true,
        };
        engine.state_store().save_sheet(&job.id, run_id, &state).await?;

        engine
            .log(
                job,
                run_id,
                LogLevel::Info,
                "reconcile",
                "Read sheet headers",
                Some(json!({ "headers": state.headers, "isNewTable": state.is_new_table })),
            )
            .await?;

        state
    } else {
        let state = engine
            .state_store()
            .load_sheet(&job.id, run_id)
            .await?
            .ok_or_else(|| SyncError::RunExpired {
                run_id: run_id.to_string(),
            })?;
        if !state.schema_sync_done {
            return Err(SyncError::SchemaIncomplete {
                run_id: run_id.to_string(),
            });
        }
        state
    };

    let range = row_range(
        &sheet_section.sheet_name,
        state.next_row,
        state.next_row + FETCH_LIMIT as u64 - 1,
    );
    let rows = sheets.read_range(&spreadsheet_id, &range).await?;
    let rows_read = rows.len();

    engine
        .log(
            job,
            run_id,
            LogLevel::Info,
            "fetch",
            &format!("Read {rows_read} sheet rows"),
            Some(json!({ "range": range })),
        )
        .await?;

    if rows_read > 0 {
        // Existing tables evolve through nullable string columns before the
        // load; new tables get an inferred schema on the load itself.
        let schema = if state.is_new_table {
            Some(infer_schema(&state.headers, &rows))
        } else {
            let existing = warehouse
                .get_metadata(&destination.project_id, &destination.dataset, &destination.table)
                .await?;
            let existing_names: Vec<String> =
                existing.iter().map(|f| f.name.to_lowercase()).collect();
            let new_columns: Vec<String> = state
                .headers
                .iter()
                .filter(|header| !existing_names.contains(&header.to_lowercase()))
                .cloned()
                .collect();
            if !new_columns.is_empty() {
                warehouse
                    .update_schema(
                        &destination.project_id,
                        &destination.dataset,
                        &destination.table,
                        &new_columns,
                    )
                    .await?;
                engine
                    .log(
                        job,
                        run_id,
                        LogLevel::Info,
                        "reconcile",
                        "Added sheet columns to destination",
                        Some(json!({ "columns": new_columns })),
                    )
                    .await?;
            }
            None
        };

        let mode = if sheet_section.append || batch_number > 1 {
            LoadMode::Append
        } else {
            LoadMode::Truncate
        };

        let ndjson = build_ndjson(&state.headers, &rows);
        let result = warehouse
            .load_ndjson(
                &destination.project_id,
                &destination.dataset,
                &destination.table,
                &ndjson,
                mode,
                schema.as_deref(),
            )
            .await?;

        if !result.error_messages.is_empty() {
            engine
                .log(
                    job,
                    run_id,
                    LogLevel::Warning,
                    "upsert",
                    "Load job reported row errors",
                    Some(json!({ "errors": result.error_messages })),
                )
                .await?;
        }

        debug!(output_rows = result.output_rows, "Load job finished");
        state.is_new_table = false;
    }

    state.rows_processed += rows_read as u64;
    state.next_row += rows_read as u64;

    let has_more = rows_read == FETCH_LIMIT;
    if has_more {
        engine.state_store().save_sheet(&job.id, run_id, &state).await?;
        return Ok(BatchResult {
            run_id: run_id.to_string(),
            has_more: true,
            next_batch: Some(batch_number + 1),
            rows_processed: rows_read as u64,
            rows_deleted: 0,
            summary: None,
        });
    }

    info!(rows = state.rows_processed, "Sheet import complete");
    let summary = format_summary(state.rows_processed, 0, state.started_at);
    Ok(BatchResult {
        run_id: run_id.to_string(),
        has_more: false,
        next_batch: None,
        rows_processed: rows_read as u64,
        rows_deleted: 0,
        summary: Some(summary),
    })
}

/// Sanitizes a raw header into `[a-z0-9_]` with a leading-digit guard.
/// Blank headers fall back to a positional name.
pub(crate) fn sanitize_header(raw: &str, index: usize) -> String {
    let mut name: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();

    while name.contains("__") {
        name = name.replace("__", "_");
    }
    let name = name.trim_matches('_').to_string();

    if name.is_empty() {
        return format!("column_{}", index + 1);
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return format!("_{name}");
    }
    name
}

/// Infers a destination schema from the page: each column's non-null
/// values are tested as date, timestamp, number, then integer, falling
/// back to string.
pub(crate) fn infer_schema(headers: &[String], rows: &[Vec<JsonValue>]) -> Vec<Field> {
    headers
        .iter()
        .enumerate()
        .map(|(index, header)| {
            let values: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get(index))
                .filter_map(cell_text)
                .filter(|text| !text.is_empty())
                .collect();

            Field::new(header.clone(), infer_column_type(&values))
        })
        .collect()
}

fn infer_column_type(values: &[String]) -> FieldType {
    if values.is_empty() {
        return FieldType::String;
    }

    if values.iter().all(|v| DATE_RE.is_match(v)) {
        return FieldType::Date;
    }
    if values.iter().all(|v| TIMESTAMP_RE.is_match(v)) {
        return FieldType::Timestamp;
    }
    if values.iter().all(|v| NUMBER_RE.is_match(v)) {
        if values.iter().all(|v| INTEGER_RE.is_match(v)) {
            return FieldType::Int;
        }
        return FieldType::Float;
    }

    FieldType::String
}

/// Builds the NDJSON payload for one page: empty strings become nulls and
/// timestamp-looking values are coerced to `YYYY-MM-DD HH:MM:SS`.
pub(crate) fn build_ndjson(headers: &[String], rows: &[Vec<JsonValue>]) -> String {
    rows.iter()
        .map(|row| {
            let mut object = serde_json::Map::new();
            for (index, header) in headers.iter().enumerate() {
                let cell = row.get(index).cloned().unwrap_or(JsonValue::Null);
                object.insert(header.clone(), convert_cell(cell));
            }
            JsonValue::Object(object).to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn convert_cell(cell: JsonValue) -> JsonValue {
    match cell {
        JsonValue::String(text) => {
            if text.is_empty() {
                JsonValue::Null
            } else if let Some(coerced) = coerce_timestamp(&text) {
                JsonValue::String(coerced)
            } else {
                JsonValue::String(text)
            }
        }
        other => other,
    }
}

/// Rewrites a timestamp-looking value into the warehouse-friendly
/// `YYYY-MM-DD HH:MM:SS` form. Dates and non-timestamps pass through.
pub(crate) fn coerce_timestamp(text: &str) -> Option<String> {
    if !TIMESTAMP_RE.is_match(text) {
        return None;
    }

    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string());
    }

    let base = text.trim_end_matches('Z').replace('T', " ");
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&base, format) {
            return Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string());
        }
    }

    None
}

fn cell_text(cell: &JsonValue) -> Option<String> {
    match cell {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}
