//! Sync engine error taxonomy.
//!
//! Every failure surfaced by the engine or its clients carries exactly one
//! of these kinds; kinds are never conflated and never silently swallowed.

use thiserror::Error;

/// Errors raised by the sync engine and its source/sink collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Job configuration is unusable: upsert keys missing from the source
    /// schema, malformed spreadsheet URL, or unknown job type.
    #[error("invalid job configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("source unavailable: {message}")]
    SourceUnavailable { message: String },

    #[error("query rejected by source: {message}")]
    QueryRejected { message: String },

    /// The warehouse did not finish the query within its synchronous window.
    #[error("query did not complete in the synchronous window: {message}")]
    QueryIncomplete { message: String },

    #[error("pagination failed: {message}")]
    PaginationFailed { message: String },

    #[error("load job failed: {message}")]
    LoadJobFailed { message: String },

    #[error("source object not found: {message}")]
    NotFound { message: String },

    #[error("permission denied by source: {message}")]
    PermissionDenied { message: String },

    #[error("sink unavailable: {message}")]
    SinkUnavailable { message: String },

    #[error("sink DDL failed: {message}")]
    SinkDdlFailed { message: String },

    #[error("sink upsert failed: {message}")]
    SinkUpsertFailed { message: String },

    #[error("sink delete failed: {message}")]
    SinkDeleteFailed { message: String },

    /// Resumption state missing for a batch number greater than one.
    #[error("run state expired or missing for run {run_id}")]
    RunExpired { run_id: String },

    /// Resumption state exists but schema reconciliation never completed.
    #[error("run {run_id} has incomplete schema synchronization")]
    SchemaIncomplete { run_id: String },

    /// Delete detection would remove more than half of the mirrored rows.
    #[error(
        "destructive anomaly: {candidates} of {sink_rows} sink rows would be deleted; aborting"
    )]
    DestructiveAnomaly { candidates: usize, sink_rows: usize },

    /// Delete detection would materialize more source keys than the
    /// configured ceiling allows.
    #[error("delete scan exceeds the {limit}-key ceiling; aborting before any delete")]
    DeleteScanOverflow { limit: usize },

    /// Run state or run log persistence failed.
    #[error("state store unavailable: {message}")]
    StateUnavailable { message: String },
}

impl SyncError {
    /// Stable kind tag used in logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid { .. } => "ConfigInvalid",
            SyncError::SourceUnavailable { .. } => "SourceUnavailable",
            SyncError::QueryRejected { .. } => "QueryRejected",
            SyncError::QueryIncomplete { .. } => "QueryIncomplete",
            SyncError::PaginationFailed { .. } => "PaginationFailed",
            SyncError::LoadJobFailed { .. } => "LoadJobFailed",
            SyncError::NotFound { .. } => "NotFound",
            SyncError::PermissionDenied { .. } => "PermissionDenied",
            SyncError::SinkUnavailable { .. } => "SinkUnavailable",
            SyncError::SinkDdlFailed { .. } => "SinkDdlFailed",
            SyncError::SinkUpsertFailed { .. } => "SinkUpsertFailed",
            SyncError::SinkDeleteFailed { .. } => "SinkDeleteFailed",
            SyncError::RunExpired { .. } => "RunExpired",
            SyncError::SchemaIncomplete { .. } => "SchemaIncomplete",
            SyncError::DestructiveAnomaly { .. } => "DestructiveAnomaly",
            SyncError::DeleteScanOverflow { .. } => "DeleteScanOverflow",
            SyncError::StateUnavailable { .. } => "StateUnavailable",
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        SyncError::ConfigInvalid {
            message: message.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        SyncError::StateUnavailable {
            message: message.into(),
        }
    }
}

impl From<crate::store::KvError> for SyncError {
    fn from(err: crate::store::KvError) -> Self {
        SyncError::state(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = SyncError::DestructiveAnomaly {
            candidates: 600,
            sink_rows: 1000,
        };
        assert_eq!(err.kind(), "DestructiveAnomaly");
        assert!(err.to_string().contains("600"));

        assert_eq!(
            SyncError::RunExpired {
                run_id: "r1".into()
            }
            .kind(),
            "RunExpired"
        );
    }
}
