//! # Run Logger
//!
//! Structured, redacted per-run log store persisted to the key/value
//! namespaces with TTLs: entries live 24 hours, the per-job run index 30
//! days. Metadata maps are redacted before they ever reach storage, and a
//! per-run entry cap guards against runaway logging.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use utoipa::ToSchema;

use crate::store::{
    KvStore, TTL_LOGS, TTL_RUN_INDEX, get_json, job_runs_key, logs_key, logs_latest_key, put_json,
};
use crate::engine::SyncError;

/// Maximum log entries retained per run; overflow goes to stderr only.
const MAX_ENTRIES_PER_RUN: usize = 500;

/// Maximum runs retained in the per-job index.
const MAX_RUNS_PER_JOB: usize = 50;

/// Longest string value kept in metadata before truncation.
const MAX_METADATA_STRING: usize = 1000;

/// Deepest metadata nesting preserved; anything deeper is collapsed.
const MAX_METADATA_DEPTH: usize = 10;

static SENSITIVE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)key|token|password|secret|credential|auth").unwrap());

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Debug,
}

/// One diagnostic event of a run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Phase tag, e.g. `reconcile`, `fetch`, `upsert`, `delete`.
    pub phase: String,
    pub job: String,
    pub run_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// One run in the per-job index, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: String,
    pub status: crate::jobs::RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Pointer to a job's most recent run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LatestRun {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-run log store over the key/value backend.
#[derive(Clone)]
pub struct RunLogger {
    kv: Arc<dyn KvStore>,
}

impl RunLogger {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Opens a run: registers it in the job's run index and points the
    /// latest-run marker at it.
    pub async fn start_run(&self, job_id: &str, run_id: &str) -> Result<(), SyncError> {
        let now = Utc::now();

        let mut runs: Vec<RunInfo> = get_json(self.kv.as_ref(), &job_runs_key(job_id))
            .await?
            .unwrap_or_default();
        runs.insert(
            0,
            RunInfo {
                run_id: run_id.to_string(),
                status: crate::jobs::RunStatus::Running,
                started_at: now,
                ended_at: None,
            },
        );
        runs.truncate(MAX_RUNS_PER_JOB);
        put_json(
            self.kv.as_ref(),
            &job_runs_key(job_id),
            &runs,
            Some(TTL_RUN_INDEX),
        )
        .await?;

        put_json(
            self.kv.as_ref(),
            &logs_latest_key(job_id),
            &LatestRun {
                run_id: run_id.to_string(),
                timestamp: now,
            },
            Some(TTL_LOGS),
        )
        .await?;

        Ok(())
    }

    /// Marks a run terminal in the index.
    pub async fn end_run(
        &self,
        job_id: &str,
        run_id: &str,
        status: crate::jobs::RunStatus,
    ) -> Result<(), SyncError> {
        let mut runs: Vec<RunInfo> = get_json(self.kv.as_ref(), &job_runs_key(job_id))
            .await?
            .unwrap_or_default();

        for run in runs.iter_mut() {
            if run.run_id == run_id {
                run.status = status;
                run.ended_at = Some(Utc::now());
            }
        }

        put_json(
            self.kv.as_ref(),
            &job_runs_key(job_id),
            &runs,
            Some(TTL_RUN_INDEX),
        )
        .await?;

        Ok(())
    }

    /// Appends one entry to a run's log, redacting metadata. Entries past
    /// the per-run cap are reported to stderr only.
    pub async fn log(
        &self,
        job_id: &str,
        job_name: &str,
        run_id: &str,
        level: LogLevel,
        phase: &str,
        message: &str,
        metadata: Option<JsonValue>,
    ) -> Result<(), SyncError> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            phase: phase.to_string(),
            job: job_name.to_string(),
            run_id: run_id.to_string(),
            message: message.to_string(),
            metadata: metadata.map(|value| redact_metadata(&value, 0)),
        };

        let key = logs_key(job_id, run_id);
        let mut entries: Vec<LogEntry> = get_json(self.kv.as_ref(), &key).await?.unwrap_or_default();

        if entries.len() >= MAX_ENTRIES_PER_RUN {
            eprintln!(
                "[runlog overflow] {} {} {:?} {}: {}",
                entry.timestamp, entry.run_id, entry.level, entry.phase, entry.message
            );
            return Ok(());
        }

        entries.push(entry);
        put_json(self.kv.as_ref(), &key, &entries, Some(TTL_LOGS)).await?;
        Ok(())
    }

    /// Lists the run index for a job, newest first.
    pub async fn list_runs(&self, job_id: &str) -> Result<Vec<RunInfo>, SyncError> {
        Ok(get_json(self.kv.as_ref(), &job_runs_key(job_id))
            .await?
            .unwrap_or_default())
    }

    /// Resolves the latest-run pointer for a job.
    pub async fn latest_run(&self, job_id: &str) -> Result<Option<LatestRun>, SyncError> {
        Ok(get_json(self.kv.as_ref(), &logs_latest_key(job_id)).await?)
    }

    /// Reads up to `limit` entries of one run.
    pub async fn read(
        &self,
        job_id: &str,
        run_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, SyncError> {
        let mut entries: Vec<LogEntry> = get_json(self.kv.as_ref(), &logs_key(job_id, run_id))
            .await?
            .unwrap_or_default();

        if let Some(limit) = limit
            && entries.len() > limit
        {
            entries.drain(..entries.len() - limit);
        }

        Ok(entries)
    }

    /// Clears one run's log, or every log and the index for the job.
    pub async fn clear(&self, job_id: &str, run_id: Option<&str>) -> Result<u64, SyncError> {
        let mut deleted = 0u64;

        match run_id {
            Some(run_id) => {
                if self.kv.delete(&logs_key(job_id, run_id)).await? {
                    deleted += 1;
                }
            }
            None => {
                for key in self.kv.list_keys(&format!("logs:{job_id}:")).await? {
                    if self.kv.delete(&key).await? {
                        deleted += 1;
                    }
                }
                self.kv.delete(&job_runs_key(job_id)).await?;
            }
        }

        Ok(deleted)
    }
}

/// Redacts a metadata value: sensitive keys are replaced with a
/// placeholder, long strings truncated, and over-deep nesting collapsed.
pub fn redact_metadata(value: &JsonValue, depth: usize) -> JsonValue {
    if depth > MAX_METADATA_DEPTH {
        warn!("metadata nesting exceeds cap; collapsing");
        return serde_json::json!({ "error": "circular" });
    }

    match value {
        JsonValue::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, inner) in map {
                if SENSITIVE_KEY.is_match(key) {
                    redacted.insert(key.clone(), JsonValue::String("[redacted]".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_metadata(inner, depth + 1));
                }
            }
            JsonValue::Object(redacted)
        }
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| redact_metadata(item, depth + 1))
                .collect(),
        ),
        JsonValue::String(text) if text.chars().count() > MAX_METADATA_STRING => {
            let truncated: String = text.chars().take(MAX_METADATA_STRING).collect();
            JsonValue::String(format!("{truncated}…"))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RunStatus;
    use crate::store::MemoryKvStore;
    use serde_json::json;

    fn logger() -> RunLogger {
        RunLogger::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn sensitive_keys_are_replaced() {
        let metadata = json!({
            "apiKey": "abc",
            "Authorization": "Bearer xyz",
            "refresh_token": "r",
            "DB_PASSWORD": "p",
            "rows": 5,
        });

        let redacted = redact_metadata(&metadata, 0);
        assert_eq!(redacted["apiKey"], "[redacted]");
        assert_eq!(redacted["Authorization"], "[redacted]");
        assert_eq!(redacted["refresh_token"], "[redacted]");
        assert_eq!(redacted["DB_PASSWORD"], "[redacted]");
        assert_eq!(redacted["rows"], 5);
    }

    #[test]
    fn nested_sensitive_keys_are_replaced() {
        let metadata = json!({ "request": { "headers": { "x-api-secret": "s" } } });
        let redacted = redact_metadata(&metadata, 0);
        assert_eq!(redacted["request"]["headers"]["x-api-secret"], "[redacted]");
    }

    #[test]
    fn long_strings_are_truncated() {
        let metadata = json!({ "body": "x".repeat(1500) });
        let redacted = redact_metadata(&metadata, 0);
        let body = redacted["body"].as_str().unwrap();
        assert!(body.ends_with('…'));
        assert!(body.chars().count() <= MAX_METADATA_STRING + 1);
    }

    #[test]
    fn over_deep_metadata_collapses() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_METADATA_DEPTH + 2) {
            value = json!({ "inner": value });
        }

        let redacted = redact_metadata(&value, 0);
        assert!(redacted.to_string().contains("\"error\":\"circular\""));
    }

    #[tokio::test]
    async fn run_lifecycle_maintains_index_and_pointer() {
        let logger = logger();

        logger.start_run("j1", "r1").await.unwrap();
        logger.start_run("j1", "r2").await.unwrap();

        let latest = logger.latest_run("j1").await.unwrap().unwrap();
        assert_eq!(latest.run_id, "r2");

        logger.end_run("j1", "r1", RunStatus::Success).await.unwrap();

        let runs = logger.list_runs("j1").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "r2");
        assert_eq!(runs[1].status, RunStatus::Success);
        assert!(runs[1].ended_at.is_some());
    }

    #[tokio::test]
    async fn run_index_is_capped() {
        let logger = logger();
        for i in 0..60 {
            logger.start_run("j1", &format!("r{i}")).await.unwrap();
        }

        let runs = logger.list_runs("j1").await.unwrap();
        assert_eq!(runs.len(), 50);
        assert_eq!(runs[0].run_id, "r59");
    }

    #[tokio::test]
    async fn log_read_honors_limit_and_keeps_newest() {
        let logger = logger();
        for i in 0..5 {
            logger
                .log("j1", "job", "r1", LogLevel::Info, "fetch", &format!("m{i}"), None)
                .await
                .unwrap();
        }

        let entries = logger.read("j1", "r1", Some(2)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "m3");
        assert_eq!(entries[1].message, "m4");
    }

    #[tokio::test]
    async fn entry_cap_stops_persistence() {
        let logger = logger();
        for i in 0..(MAX_ENTRIES_PER_RUN + 10) {
            logger
                .log("j1", "job", "r1", LogLevel::Debug, "upsert", &format!("m{i}"), None)
                .await
                .unwrap();
        }

        let entries = logger.read("j1", "r1", None).await.unwrap();
        assert_eq!(entries.len(), MAX_ENTRIES_PER_RUN);
    }

    #[tokio::test]
    async fn clear_removes_runs_and_index() {
        let logger = logger();
        logger.start_run("j1", "r1").await.unwrap();
        logger
            .log("j1", "job", "r1", LogLevel::Info, "fetch", "m", None)
            .await
            .unwrap();

        let deleted = logger.clear("j1", Some("r1")).await.unwrap();
        assert_eq!(deleted, 1);

        logger.start_run("j1", "r2").await.unwrap();
        logger
            .log("j1", "job", "r2", LogLevel::Info, "fetch", "m", None)
            .await
            .unwrap();
        let deleted = logger.clear("j1", None).await.unwrap();
        assert!(deleted >= 1);
        assert!(logger.list_runs("j1").await.unwrap().is_empty());
    }
}
