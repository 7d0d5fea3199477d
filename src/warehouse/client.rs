//! REST client for the warehouse.
//!
//! Values arrive from the warehouse as JSON strings and are decoded against
//! the declared schema. Integers that exceed the safe-integer range, or
//! whose column is force-listed, are preserved as strings so no precision
//! is ever lost in transit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tokio::time::sleep;
use tracing::{debug, info};

use super::auth::{SCOPE_WAREHOUSE, TokenProvider};
use crate::engine::SyncError;
use crate::schema::{Field, FieldType, Row};

/// Largest integer a lossy double can represent exactly.
const SAFE_INTEGER_MAX: i64 = 9_007_199_254_740_991;

/// Page size requested per result fetch.
const RESULTS_PER_PAGE: u32 = 1000;

/// Poll interval and cap for load jobs.
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOAD_POLL_ATTEMPTS: u32 = 120;

/// Write disposition for load jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Append,
    Truncate,
}

impl LoadMode {
    fn disposition(&self) -> &'static str {
        match self {
            LoadMode::Append => "WRITE_APPEND",
            LoadMode::Truncate => "WRITE_TRUNCATE",
        }
    }
}

/// Outcome of a completed load job.
#[derive(Debug, Clone, Default)]
pub struct LoadJobResult {
    pub output_rows: u64,
    /// Row-level errors reported by the warehouse for a job that still
    /// reached a terminal state.
    pub error_messages: Vec<String>,
}

/// Client for warehouse metadata, queries, and load jobs.
pub struct WarehouseClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<RawRow>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(default)]
    f: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    #[serde(default)]
    v: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadJobResource {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    error_result: Option<JobError>,
    #[serde(default)]
    errors: Vec<JobError>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

impl WarehouseClient {
    pub fn new(http: reqwest::Client, base_url: String, tokens: Arc<TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Fetches the ordered field list of a table.
    pub async fn get_metadata(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> Result<Vec<Field>, SyncError> {
        let url = format!(
            "{}/bigquery/v2/projects/{project}/datasets/{dataset}/tables/{table}",
            self.base_url
        );
        let response = self.get(&url).await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound {
                message: format!("table {dataset}.{table} does not exist"),
            });
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::PermissionDenied {
                message: format!("access to {dataset}.{table} denied"),
            });
        }
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable {
                message: format!("metadata fetch failed ({status})"),
            });
        }

        let resource: TableResource =
            response
                .json()
                .await
                .map_err(|e| SyncError::SourceUnavailable {
                    message: format!("invalid metadata response: {e}"),
                })?;

        Ok(resource
            .schema
            .map(|schema| schema.fields)
            .unwrap_or_default()
            .into_iter()
            .map(|raw| Field {
                field_type: FieldType::from_warehouse(&raw.type_name),
                nullable: raw.mode.as_deref() != Some("REQUIRED"),
                name: raw.name,
            })
            .collect())
    }

    /// Runs a query and follows continuation tokens, returning every row as
    /// a name-keyed mapping decoded against the result schema.
    pub async fn query_all(
        &self,
        project: &str,
        sql: &str,
        force_string_set: &HashSet<String>,
    ) -> Result<Vec<Row>, SyncError> {
        let url = format!("{}/bigquery/v2/projects/{project}/queries", self.base_url);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "maxResults": RESULTS_PER_PAGE,
        });

        let token = self.tokens.token(SCOPE_WAREHOUSE).await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                message: format!("query request failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::QueryRejected {
                message: format!("query rejected ({status}): {}", snippet(&body)),
            });
        }
        if !status.is_success() {
            return Err(SyncError::SourceUnavailable {
                message: format!("query failed ({status})"),
            });
        }

        let mut page: QueryResponse =
            response
                .json()
                .await
                .map_err(|e| SyncError::SourceUnavailable {
                    message: format!("invalid query response: {e}"),
                })?;

        if !page.job_complete {
            let job_id = page
                .job_reference
                .as_ref()
                .map(|r| r.job_id.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SyncError::QueryIncomplete {
                message: format!("job {job_id} still running"),
            });
        }

        let fields = page
            .schema
            .take()
            .map(|schema| schema.fields)
            .unwrap_or_default();
        let job_id = page.job_reference.as_ref().map(|r| r.job_id.clone());

        let mut rows = Vec::new();
        decode_rows(&mut rows, &page.rows, &fields, force_string_set);

        let mut page_token = page.page_token.take();
        while let Some(token_value) = page_token {
            let job_id = job_id.as_deref().ok_or_else(|| SyncError::PaginationFailed {
                message: "continuation token without job reference".to_string(),
            })?;
            let next = self
                .fetch_results_page(project, job_id, &token_value)
                .await?;
            decode_rows(&mut rows, &next.rows, &fields, force_string_set);
            page_token = next.page_token;
        }

        debug!(rows = rows.len(), "Query returned");
        Ok(rows)
    }

    async fn fetch_results_page(
        &self,
        project: &str,
        job_id: &str,
        page_token: &str,
    ) -> Result<QueryResponse, SyncError> {
        let url = format!(
            "{}/bigquery/v2/projects/{project}/queries/{job_id}",
            self.base_url
        );

        let token = self.tokens.token(SCOPE_WAREHOUSE).await?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .query(&[
                ("pageToken", page_token),
                ("maxResults", &RESULTS_PER_PAGE.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SyncError::PaginationFailed {
                message: format!("results page fetch failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::PaginationFailed {
                message: format!("results page fetch failed ({status})"),
            });
        }

        response.json().await.map_err(|e| SyncError::PaginationFailed {
            message: format!("invalid results page: {e}"),
        })
    }

    /// Submits a multipart NDJSON load job and polls it to a terminal state.
    ///
    /// `schema` is supplied only when the destination table is being created;
    /// otherwise it is omitted so the warehouse evolves the schema itself
    /// (new columns added, absent columns left NULL).
    pub async fn load_ndjson(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
        ndjson: &str,
        mode: LoadMode,
        schema: Option<&[Field]>,
    ) -> Result<LoadJobResult, SyncError> {
        let mut load_config = json!({
            "destinationTable": {
                "projectId": project,
                "datasetId": dataset,
                "tableId": table,
            },
            "sourceFormat": "NEWLINE_DELIMITED_JSON",
            "writeDisposition": mode.disposition(),
        });

        if let Some(fields) = schema {
            let raw_fields: Vec<JsonValue> = fields
                .iter()
                .map(|field| {
                    json!({
                        "name": field.name,
                        "type": field.field_type.warehouse_type(),
                        "mode": "NULLABLE",
                    })
                })
                .collect();
            load_config["schema"] = json!({ "fields": raw_fields });
        } else {
            load_config["schemaUpdateOptions"] = json!(["ALLOW_FIELD_ADDITION"]);
        }

        let metadata = json!({ "configuration": { "load": load_config } });

        let boundary = format!("mirrorsync-{}", uuid::Uuid::new_v4().simple());
        let body = format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n\
             --{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n{ndjson}\r\n\
             --{boundary}--",
            meta = metadata,
        );

        let url = format!(
            "{}/upload/bigquery/v2/projects/{project}/jobs?uploadType=multipart",
            self.base_url
        );

        let token = self.tokens.token(SCOPE_WAREHOUSE).await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header(
                "content-type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                message: format!("load submit failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::LoadJobFailed {
                message: format!("load submit rejected ({status}): {}", snippet(&body)),
            });
        }

        let job: LoadJobResource =
            response
                .json()
                .await
                .map_err(|e| SyncError::LoadJobFailed {
                    message: format!("invalid load job response: {e}"),
                })?;

        let job_id = job
            .job_reference
            .as_ref()
            .map(|r| r.job_id.clone())
            .ok_or_else(|| SyncError::LoadJobFailed {
                message: "load job has no job reference".to_string(),
            })?;

        self.poll_load_job(project, &job_id).await
    }

    async fn poll_load_job(&self, project: &str, job_id: &str) -> Result<LoadJobResult, SyncError> {
        let url = format!("{}/bigquery/v2/projects/{project}/jobs/{job_id}", self.base_url);

        for _ in 0..LOAD_POLL_ATTEMPTS {
            let response = self.get(&url).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SyncError::LoadJobFailed {
                    message: format!("load job poll failed ({status})"),
                });
            }

            let job: LoadJobResource =
                response
                    .json()
                    .await
                    .map_err(|e| SyncError::LoadJobFailed {
                        message: format!("invalid load job state: {e}"),
                    })?;

            if let Some(job_status) = job.status
                && job_status.state == "DONE"
            {
                let error_messages: Vec<String> = job_status
                    .errors
                    .iter()
                    .map(|e| e.message.clone())
                    .collect();

                if let Some(fatal) = job_status.error_result {
                    let detail = if error_messages.is_empty() {
                        fatal.message
                    } else {
                        format!("{}; {}", fatal.message, error_messages.join("; "))
                    };
                    return Err(SyncError::LoadJobFailed { message: detail });
                }

                let output_rows = job
                    .statistics
                    .and_then(|s| s.load)
                    .and_then(|l| l.output_rows)
                    .and_then(|rows| rows.parse().ok())
                    .unwrap_or(0);

                info!(job_id, output_rows, "Load job completed");
                return Ok(LoadJobResult {
                    output_rows,
                    error_messages,
                });
            }

            sleep(LOAD_POLL_INTERVAL).await;
        }

        Err(SyncError::LoadJobFailed {
            message: format!("load job {job_id} did not reach DONE"),
        })
    }

    /// Adds nullable string columns to a table, preserving existing ones.
    pub async fn update_schema(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
        new_columns: &[String],
    ) -> Result<(), SyncError> {
        if new_columns.is_empty() {
            return Ok(());
        }

        let url = format!(
            "{}/bigquery/v2/projects/{project}/datasets/{dataset}/tables/{table}",
            self.base_url
        );

        let response = self.get(&url).await?;
        if !response.status().is_success() {
            return Err(SyncError::SourceUnavailable {
                message: format!("schema read failed ({})", response.status()),
            });
        }
        let resource: TableResource =
            response
                .json()
                .await
                .map_err(|e| SyncError::SourceUnavailable {
                    message: format!("invalid table resource: {e}"),
                })?;

        let mut fields = resource.schema.map(|s| s.fields).unwrap_or_default();
        for column in new_columns {
            fields.push(RawField {
                name: column.clone(),
                type_name: "STRING".to_string(),
                mode: Some("NULLABLE".to_string()),
            });
        }

        let token = self.tokens.token(SCOPE_WAREHOUSE).await?;
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&token)
            .json(&json!({ "schema": { "fields": fields } }))
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                message: format!("schema update failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::SourceUnavailable {
                message: format!("schema update rejected ({status}): {}", snippet(&body)),
            });
        }

        info!(table, added = new_columns.len(), "Extended warehouse schema");
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, SyncError> {
        let token = self.tokens.token(SCOPE_WAREHOUSE).await?;
        self.http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                message: format!("request failed: {e}"),
            })
    }
}

fn decode_rows(
    out: &mut Vec<Row>,
    raw_rows: &[RawRow],
    fields: &[RawField],
    force_string_set: &HashSet<String>,
) {
    for raw in raw_rows {
        let mut row = Row::new();
        for (index, field) in fields.iter().enumerate() {
            let cell = raw.f.get(index).map(|c| &c.v).unwrap_or(&JsonValue::Null);
            row.insert(
                field.name.clone(),
                decode_cell(cell, &field.type_name, force_string_set.contains(&field.name)),
            );
        }
        out.push(row);
    }
}

/// Decodes one warehouse cell against its declared type.
fn decode_cell(value: &JsonValue, type_name: &str, force_string: bool) -> JsonValue {
    let JsonValue::String(text) = value else {
        return value.clone();
    };

    match FieldType::from_warehouse(type_name) {
        FieldType::Int => {
            if force_string {
                return JsonValue::String(text.clone());
            }
            match text.parse::<i64>() {
                Ok(parsed) if (-SAFE_INTEGER_MAX..=SAFE_INTEGER_MAX).contains(&parsed) => {
                    JsonValue::Number(parsed.into())
                }
                _ => JsonValue::String(text.clone()),
            }
        }
        FieldType::Float => match text.parse::<f64>() {
            Ok(parsed) => serde_json::Number::from_f64(parsed)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(text.clone())),
            Err(_) => JsonValue::String(text.clone()),
        },
        FieldType::Bool => match text.as_str() {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            _ => JsonValue::String(text.clone()),
        },
        _ => JsonValue::String(text.clone()),
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let head: String = body.chars().take(200).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}
