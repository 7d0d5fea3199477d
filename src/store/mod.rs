//! # Key/Value Store
//!
//! Opaque key/value persistence behind the [`KvStore`] trait. The service
//! keeps four namespaces here: job configurations (`job:{id}`), per-run
//! resumption state (`sync_state:{jobId}:{runId}`), run logs
//! (`logs:{jobId}:{runId}` plus a `:latest` pointer), and the per-job run
//! index (`jobRuns:{jobId}`). Writes are idempotent rewrites; values may
//! carry a TTL that acts as a garbage-collection backstop.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod memory;
mod sql;

pub use memory::MemoryKvStore;
pub use sql::SqlKvStore;

/// TTL for per-run resumption state (garbage-collection backstop).
pub const TTL_RUN_STATE: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for run log entries and the latest-run pointer.
pub const TTL_LOGS: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for the per-job run index.
pub const TTL_RUN_INDEX: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors surfaced by key/value backends.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key/value backend error: {0}")]
    Backend(String),

    #[error("stored value could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Opaque key/value store with TTL support.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the value stored under `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError>;

    /// Store `value` under `key`, replacing any previous value. A `ttl`
    /// marks the entry for lazy expiry.
    async fn put(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Remove the entry under `key`. Returns whether an entry existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// List all unexpired keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Drop entries whose TTL has elapsed. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, KvError>;
}

/// Typed read helper over [`KvStore::get`].
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed write helper over [`KvStore::put`].
pub async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), KvError> {
    store.put(key, serde_json::to_value(value)?, ttl).await
}

/// Key for a job configuration document.
pub fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Key for a run's resumption state.
pub fn sync_state_key(job_id: &str, run_id: &str) -> String {
    format!("sync_state:{job_id}:{run_id}")
}

/// Key for a run's log entries.
pub fn logs_key(job_id: &str, run_id: &str) -> String {
    format!("logs:{job_id}:{run_id}")
}

/// Key for the pointer to a job's most recent run.
pub fn logs_latest_key(job_id: &str) -> String {
    format!("logs:{job_id}:latest")
}

/// Key for the per-job run index.
pub fn job_runs_key(job_id: &str) -> String {
    format!("jobRuns:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_namespaces() {
        assert_eq!(job_key("a1"), "job:a1");
        assert_eq!(sync_state_key("a1", "r9"), "sync_state:a1:r9");
        assert_eq!(logs_key("a1", "r9"), "logs:a1:r9");
        assert_eq!(logs_latest_key("a1"), "logs:a1:latest");
        assert_eq!(job_runs_key("a1"), "jobRuns:a1");
    }

    #[tokio::test]
    async fn typed_helpers_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Doc {
            n: u32,
        }

        let store = MemoryKvStore::new();
        put_json(&store, "job:x", &Doc { n: 7 }, None)
            .await
            .unwrap();
        let read: Option<Doc> = get_json(&store, "job:x").await.unwrap();
        assert_eq!(read, Some(Doc { n: 7 }));
    }
}
