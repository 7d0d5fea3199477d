//! End-of-run delete detection.
//!
//! Computes the set difference between sink keys and source keys and
//! removes sink rows whose unique-key tuple no longer exists in the
//! source. Three circuit breakers guard the phase: an empty source aborts
//! with a warning, an empty sink short-circuits, and a candidate set
//! larger than half the mirror fails the run outright.

use std::collections::HashSet;

use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::{DELETE_SCAN_PAGE, SyncEngine};
use crate::engine::SyncError;
use crate::jobs::{JobConfig, SinkSection, WarehouseSection};
use crate::runlog::LogLevel;
use crate::schema::{Row, quote_ident};
use crate::sink::SinkClient;
use crate::warehouse::WarehouseClient;

#[allow(clippy::too_many_arguments)]
pub(super) async fn detect_and_delete(
    engine: &SyncEngine,
    job: &JobConfig,
    run_id: &str,
    warehouse_section: &WarehouseSection,
    sink_section: &SinkSection,
    warehouse: &WarehouseClient,
    sink: &SinkClient,
    force_strings: &HashSet<String>,
) -> Result<u64, SyncError> {
    let key_columns = &sink_section.upsert_columns;
    let max_keys = engine.engine_config().delete_scan_max_keys;

    // Project only the key columns from the source, with no incremental
    // filter, and materialize their canonical encodings.
    let projection = key_columns
        .iter()
        .map(|c| crate::engine::cursor::warehouse_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let source_sql = format!(
        "SELECT {projection} FROM `{}.{}.{}`",
        warehouse_section.project_id, warehouse_section.dataset, warehouse_section.table
    );

    let source_rows = warehouse
        .query_all(&warehouse_section.project_id, &source_sql, force_strings)
        .await?;

    if source_rows.len() > max_keys {
        return Err(SyncError::DeleteScanOverflow { limit: max_keys });
    }

    let source_keys: HashSet<String> = source_rows
        .iter()
        .map(|row| canonical_key(row, key_columns, force_strings))
        .collect();

    // Gate A: an empty source is far more likely a misconfiguration or
    // connectivity failure than a truly emptied table.
    if source_keys.is_empty() {
        engine
            .log(
                job,
                run_id,
                LogLevel::Warning,
                "delete",
                "Source returned no keys; skipping delete detection",
                None,
            )
            .await?;
        warn!(table = %sink_section.table, "Delete phase skipped: source empty");
        return Ok(0);
    }

    // Page through sink keys with OFFSET pagination until a short page.
    let mut sink_tuples: Vec<Vec<JsonValue>> = Vec::new();
    let mut sink_keys: Vec<String> = Vec::new();
    let order_by = key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let select_list = order_by.clone();
    let mut offset = 0usize;

    loop {
        let sql = format!(
            "SELECT {select_list} FROM {} ORDER BY {order_by} LIMIT {DELETE_SCAN_PAGE} OFFSET {offset}",
            quote_ident(&sink_section.table)
        );
        let page = sink.exec_query(&sql).await?;
        let page_len = page.len();

        for row in &page {
            sink_tuples.push(
                key_columns
                    .iter()
                    .map(|column| normalize_key_value(column, row.get(column), force_strings))
                    .collect(),
            );
            sink_keys.push(canonical_tuple(sink_tuples.last().expect("just pushed")));
        }

        if sink_keys.len() > max_keys {
            return Err(SyncError::DeleteScanOverflow { limit: max_keys });
        }
        if page_len < DELETE_SCAN_PAGE {
            break;
        }
        offset += DELETE_SCAN_PAGE;
    }

    // Gate B: nothing mirrored yet, nothing to delete.
    if sink_keys.is_empty() {
        return Ok(0);
    }

    let candidates: Vec<Vec<JsonValue>> = sink_tuples
        .into_iter()
        .zip(sink_keys.iter())
        .filter(|(_, key)| !source_keys.contains(key.as_str()))
        .map(|(tuple, _)| tuple)
        .collect();

    if candidates.is_empty() {
        return Ok(0);
    }

    // Gate C: deleting more than half the mirror points at a silent source
    // scope regression, not genuine deletions.
    if candidates.len() * 2 > sink_keys.len() {
        return Err(SyncError::DestructiveAnomaly {
            candidates: candidates.len(),
            sink_rows: sink_keys.len(),
        });
    }

    engine
        .log(
            job,
            run_id,
            LogLevel::Info,
            "delete",
            &format!("Deleting {} stale rows", candidates.len()),
            Some(json!({ "sinkRows": sink_keys.len(), "sourceKeys": source_keys.len() })),
        )
        .await?;

    let deleted = sink
        .delete(&sink_section.table, key_columns, &candidates)
        .await?;

    info!(table = %sink_section.table, deleted, "Delete phase complete");
    Ok(deleted)
}

/// Canonical encoding of a key: the JSON array of upsert-column values in
/// declared order. Distinguishes `"1"` from `1` while letting force-listed
/// columns compare as strings on both sides.
pub(crate) fn canonical_key(
    row: &Row,
    key_columns: &[String],
    force_strings: &HashSet<String>,
) -> String {
    let tuple: Vec<JsonValue> = key_columns
        .iter()
        .map(|column| normalize_key_value(column, row.get(column), force_strings))
        .collect();
    canonical_tuple(&tuple)
}

fn canonical_tuple(tuple: &[JsonValue]) -> String {
    serde_json::to_string(tuple).unwrap_or_default()
}

/// Force-listed columns travel as strings from the source; the sink hands
/// their values back as numbers. Normalizing both sides to strings keeps
/// the set difference honest.
fn normalize_key_value(
    column: &str,
    value: Option<&JsonValue>,
    force_strings: &HashSet<String>,
) -> JsonValue {
    let value = value.cloned().unwrap_or(JsonValue::Null);
    if force_strings.contains(column)
        && let JsonValue::Number(number) = &value
    {
        return JsonValue::String(number.to_string());
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, JsonValue)]) -> Row {
        let mut row = Row::new();
        for (key, value) in pairs {
            row.insert(key.to_string(), value.clone());
        }
        row
    }

    #[test]
    fn canonical_key_distinguishes_strings_from_numbers() {
        let no_force = HashSet::new();
        let columns = vec!["id".to_string()];

        let numeric = canonical_key(&row(&[("id", json!(1))]), &columns, &no_force);
        let text = canonical_key(&row(&[("id", json!("1"))]), &columns, &no_force);

        assert_eq!(numeric, "[1]");
        assert_eq!(text, "[\"1\"]");
        assert_ne!(numeric, text);
    }

    #[test]
    fn canonical_key_preserves_declared_order() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let key = canonical_key(
            &row(&[("b", json!(2)), ("a", json!(1))]),
            &columns,
            &HashSet::new(),
        );
        assert_eq!(key, "[1,2]");
    }

    #[test]
    fn force_listed_numbers_normalize_to_strings() {
        let force: HashSet<String> = ["id".to_string()].into_iter().collect();
        let columns = vec!["id".to_string()];

        let from_sink = canonical_key(&row(&[("id", json!(7))]), &columns, &force);
        let from_source = canonical_key(&row(&[("id", json!("7"))]), &columns, &force);

        assert_eq!(from_sink, from_source);
    }

    #[test]
    fn missing_key_columns_encode_as_null() {
        let key = canonical_key(&row(&[]), &["id".to_string()], &HashSet::new());
        assert_eq!(key, "[null]");
    }
}
