//! # Sink Client
//!
//! Client for the transactional sink over its PostgREST-compatible API.
//! Row writes go through the REST upsert path; DDL and dynamic reads go
//! through privileged stored procedures (`exec_ddl` / `exec_sql`). Deletes
//! are issued as REST filter requests in bounded chunks so request URLs
//! stay within length limits.

use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use crate::engine::SyncError;
use crate::schema::{Field, FieldType, Row, SYNCED_AT_COLUMN, quote_ident};

/// Tuples per delete request.
const DELETE_CHUNK: usize = 200;

/// Client for upserts, deletes, DDL, and introspection against the sink.
pub struct SinkClient {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl SinkClient {
    pub fn new(http: reqwest::Client, base_url: String, service_key: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
        }
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    /// Atomic upsert against the unique constraint over `conflict_columns`.
    /// No-op for an empty row set.
    pub async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[String],
    ) -> Result<(), SyncError> {
        if rows.is_empty() {
            return Ok(());
        }

        let response = self
            .authed(self.http.post(self.rest_url(table)))
            .query(&[("on_conflict", conflict_columns.join(","))])
            .header("prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(|e| SyncError::SinkUnavailable {
                message: format!("upsert request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::SinkUpsertFailed {
                message: format!("upsert into {table} rejected ({status}): {}", snippet(&body)),
            });
        }

        debug!(table, rows = rows.len(), "Upserted rows");
        Ok(())
    }

    async fn rpc(&self, function: &str, query: &str) -> Result<(), SyncError> {
        let response = self
            .authed(self.http.post(self.rpc_url(function)))
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| SyncError::SinkUnavailable {
                message: format!("rpc {function} request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::SinkUnavailable {
                message: format!("rpc {function} rejected ({status}): {}", snippet(&body)),
            });
        }

        Ok(())
    }

    /// Executes a DDL statement via the privileged stored procedure, then
    /// signals the API layer to reload its schema cache.
    pub async fn exec_ddl(&self, statement: &str) -> Result<(), SyncError> {
        self.rpc("exec_ddl", statement)
            .await
            .map_err(|err| match err {
                SyncError::SinkUnavailable { message } => SyncError::SinkDdlFailed { message },
                other => other,
            })?;

        // Schema cache reload; failure here is not fatal to the DDL itself.
        let _ = self.rpc("exec_ddl", "NOTIFY pgrst, 'reload schema'").await;

        info!(statement, "Applied sink DDL");
        Ok(())
    }

    /// Executes a dynamic SELECT via the privileged stored procedure. A
    /// "relation does not exist" error is coerced to an empty result so a
    /// first-ever run can proceed before its table exists.
    pub async fn exec_query(&self, sql: &str) -> Result<Vec<Row>, SyncError> {
        let response = self
            .authed(self.http.post(self.rpc_url("exec_sql")))
            .json(&json!({ "query": sql }))
            .send()
            .await
            .map_err(|e| SyncError::SinkUnavailable {
                message: format!("query request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_missing_relation(&body) {
                return Ok(Vec::new());
            }
            return Err(SyncError::SinkUnavailable {
                message: format!("sink query failed ({status}): {}", snippet(&body)),
            });
        }

        let value: JsonValue = response
            .json()
            .await
            .map_err(|e| SyncError::SinkUnavailable {
                message: format!("invalid sink query response: {e}"),
            })?;

        match value {
            JsonValue::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    JsonValue::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(SyncError::SinkUnavailable {
                message: format!("sink query returned non-array payload: {other}"),
            }),
        }
    }

    /// Returns the maximum value of `column`, or `None` when the table is
    /// empty or absent.
    pub async fn last_value(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<JsonValue>, SyncError> {
        let sql = format!(
            "SELECT MAX({}) AS value FROM {}",
            quote_ident(column),
            quote_ident(table)
        );

        let rows = self.exec_query(&sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.get("value").cloned())
            .filter(|value| !value.is_null()))
    }

    /// Describes a table's columns from the information schema, mapped back
    /// to source-equivalent type classes. The engine-owned `synced_at`
    /// column is excluded.
    pub async fn describe(&self, table: &str) -> Result<Vec<Field>, SyncError> {
        let sql = format!(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = '{}' ORDER BY ordinal_position",
            table.replace('\'', "''")
        );

        let rows = self.exec_query(&sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = row.get("column_name")?.as_str()?.to_string();
                if name.eq_ignore_ascii_case(SYNCED_AT_COLUMN) {
                    return None;
                }
                let data_type = row.get("data_type").and_then(|v| v.as_str()).unwrap_or("");
                Some(Field {
                    field_type: FieldType::from_sink_type(data_type),
                    nullable: row.get("is_nullable").and_then(|v| v.as_str()) != Some("NO"),
                    name,
                })
            })
            .collect())
    }

    /// Bulk delete by unique-key tuples, chunked to stay under URL-length
    /// limits. Returns the number of rows removed.
    pub async fn delete(
        &self,
        table: &str,
        key_columns: &[String],
        key_tuples: &[Vec<JsonValue>],
    ) -> Result<u64, SyncError> {
        if key_tuples.is_empty() || key_columns.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0u64;
        for chunk in key_tuples.chunks(DELETE_CHUNK) {
            let filter = if key_columns.len() == 1 {
                let values = chunk
                    .iter()
                    .map(|tuple| filter_literal(&tuple[0]))
                    .collect::<Vec<_>>()
                    .join(",");
                (key_columns[0].clone(), format!("in.({values})"))
            } else {
                let disjuncts = chunk
                    .iter()
                    .map(|tuple| {
                        let conjuncts = key_columns
                            .iter()
                            .zip(tuple.iter())
                            .map(|(column, value)| format!("{column}.eq.{}", filter_literal(value)))
                            .collect::<Vec<_>>()
                            .join(",");
                        format!("and({conjuncts})")
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                ("or".to_string(), format!("({disjuncts})"))
            };

            let response = self
                .authed(self.http.delete(self.rest_url(table)))
                .query(&[(filter.0.as_str(), filter.1.as_str())])
                .header("prefer", "count=exact")
                .send()
                .await
                .map_err(|e| SyncError::SinkUnavailable {
                    message: format!("delete request failed: {e}"),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::SinkDeleteFailed {
                    message: format!("delete from {table} rejected ({status}): {}", snippet(&body)),
                });
            }

            deleted += response
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(chunk.len() as u64);
        }

        info!(table, deleted, "Deleted rows by key");
        Ok(deleted)
    }
}

/// Renders a JSON value as a PostgREST filter literal. Strings are wrapped
/// in double quotes with embedded quotes and backslashes escaped, so row
/// data can never break out of the filter expression.
fn filter_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => {
            format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
        }
        JsonValue::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.parse().ok()
}

fn is_missing_relation(body: &str) -> bool {
    body.contains("42P01") || (body.contains("relation") && body.contains("does not exist"))
}

fn snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let head: String = body.chars().take(200).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}
