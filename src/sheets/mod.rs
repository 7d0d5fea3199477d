//! # Spreadsheet Reader
//!
//! Read-only client for the spreadsheet API used by sheet-to-warehouse
//! jobs. Reads are retried on 429 and 5xx with exponential backoff and
//! jitter; all other statuses fail immediately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::engine::SyncError;
use crate::warehouse::TokenProvider;
use crate::warehouse::auth::SCOPE_SHEETS;

/// Backoff schedule between retry attempts, jittered by ±500ms.
const BACKOFF_SECONDS: [u64; 3] = [1, 2, 4];
const JITTER_MS: i64 = 500;

/// Client for spreadsheet range reads.
pub struct SheetsClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

impl SheetsClient {
    pub fn new(http: reqwest::Client, base_url: String, tokens: Arc<TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Reads a range in A1 notation, returning the rows of cell values.
    pub async fn read_range(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Vec<Vec<JsonValue>>, SyncError> {
        let url = format!(
            "{}/v4/spreadsheets/{spreadsheet_id}/values/{}",
            self.base_url,
            urlencode(range)
        );

        let mut last_failure = String::new();
        for attempt in 0..=BACKOFF_SECONDS.len() {
            match self.read_once(&url).await {
                Ok(values) => {
                    debug!(range, rows = values.len(), attempt, "Read sheet range");
                    return Ok(values);
                }
                Err(ReadFailure::Fatal(err)) => return Err(err),
                Err(ReadFailure::Retryable(message)) => {
                    last_failure = message;
                    if attempt < BACKOFF_SECONDS.len() {
                        let delay = jittered_backoff(attempt);
                        warn!(
                            range,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            failure = %last_failure,
                            "Sheet read failed; backing off"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(SyncError::SourceUnavailable {
            message: format!("sheet read exhausted retries: {last_failure}"),
        })
    }

    async fn read_once(&self, url: &str) -> Result<Vec<Vec<JsonValue>>, ReadFailure> {
        let token = self
            .tokens
            .token(SCOPE_SHEETS)
            .await
            .map_err(ReadFailure::Fatal)?;

        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ReadFailure::Retryable(format!("transport error: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ReadFailure::Retryable(format!("status {status}")));
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ReadFailure::Fatal(SyncError::PermissionDenied {
                message: "spreadsheet access denied".to_string(),
            }));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ReadFailure::Fatal(SyncError::NotFound {
                message: "spreadsheet or range not found".to_string(),
            }));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReadFailure::Fatal(SyncError::SourceUnavailable {
                message: format!("sheet read failed ({status}): {body}"),
            }));
        }

        let value_range: ValueRange = response
            .json()
            .await
            .map_err(|e| ReadFailure::Retryable(format!("invalid response: {e}")))?;

        Ok(value_range.values)
    }
}

enum ReadFailure {
    Retryable(String),
    Fatal(SyncError),
}

fn jittered_backoff(attempt: usize) -> Duration {
    let base_ms = BACKOFF_SECONDS[attempt.min(BACKOFF_SECONDS.len() - 1)] as i64 * 1000;
    let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
    Duration::from_millis(base_ms.saturating_add(jitter).max(0) as u64)
}

/// Extracts the spreadsheet id from a sharing URL.
pub fn parse_spreadsheet_id(url: &str) -> Result<String, SyncError> {
    let marker = "/spreadsheets/d/";
    let start = url
        .find(marker)
        .map(|index| index + marker.len())
        .ok_or_else(|| SyncError::config(format!("malformed spreadsheet URL: {url}")))?;

    let id: String = url[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if id.is_empty() {
        return Err(SyncError::config(format!("malformed spreadsheet URL: {url}")));
    }

    Ok(id)
}

/// Builds an A1 range covering whole rows `start..=end` of a sheet,
/// quoting the sheet name.
pub fn row_range(sheet_name: &str, start_row: u64, end_row: u64) -> String {
    format!("'{}'!{start_row}:{end_row}", sheet_name.replace('\'', "''"))
}

fn urlencode(raw: &str) -> String {
    raw.chars()
        .flat_map(|c| match c {
            '!' => "%21".chars().collect::<Vec<_>>(),
            '\'' => "%27".chars().collect(),
            ' ' => "%20".chars().collect(),
            ':' => "%3A".chars().collect(),
            other => vec![other],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spreadsheet_id_parses_from_sharing_url() {
        let id = parse_spreadsheet_id(
            "https://docs.google.com/spreadsheets/d/1AbC-def_123/edit#gid=0",
        )
        .unwrap();
        assert_eq!(id, "1AbC-def_123");
    }

    #[test]
    fn malformed_url_is_config_error() {
        let err = parse_spreadsheet_id("https://example.com/nothing").unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn row_range_quotes_sheet_names() {
        assert_eq!(row_range("Sheet1", 2, 5001), "'Sheet1'!2:5001");
        assert_eq!(row_range("It's data", 1, 1), "'It''s data'!1:1");
    }

    #[test]
    fn backoff_stays_near_schedule() {
        for attempt in 0..3 {
            let delay = jittered_backoff(attempt).as_millis() as i64;
            let base = BACKOFF_SECONDS[attempt] as i64 * 1000;
            assert!((delay - base).abs() <= JITTER_MS, "delay {delay} for base {base}");
        }
    }
}
