//! Warehouse-to-sink batch execution.
//!
//! Batch 1 reconciles schema before fetching; every batch fetches one
//! bounded page under the composite ordering, upserts it in sub-batches,
//! and either persists the cursor for the next invocation or enters the
//! delete phase and finishes the run.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info};

use super::cursor::{CursorTuple, cursor_predicate, incremental_filter, order_clause, warehouse_ident};
use super::{BatchResult, FETCH_LIMIT, SyncEngine, UPSERT_SUB_BATCH, deletes, format_summary};
use crate::engine::SyncError;
use crate::jobs::{JobConfig, SinkSection, WarehouseSection};
use crate::runlog::LogLevel;
use crate::schema::{self, Row};
use crate::state::RunState;

/// Pause after applying drift DDL so the sink's schema cache settles.
const SCHEMA_PROPAGATION_PAUSE: Duration = Duration::from_secs(1);

pub(super) async fn run_batch(
    engine: &SyncEngine,
    job: &JobConfig,
    run_id: &str,
    batch_number: u32,
    deadline: Instant,
) -> Result<BatchResult, SyncError> {
    let warehouse_section = job.bigquery.as_ref().expect("validated");
    let sink_section = job.supabase.as_ref().expect("validated");

    let warehouse = engine.warehouse_client().await?;
    let sink = engine.sink_client()?;

    let mut state = if batch_number == 1 {
        reconcile(engine, job, warehouse_section, sink_section, &warehouse, &sink, run_id).await?
    } else {
        let state = engine
            .state_store()
            .load(&job.id, run_id)
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

    // Fetch one page under the composite ordering.
    let tie_column = &sink_section.upsert_columns[0];
    let inc_column = warehouse_section
        .incremental_column
        .as_deref()
        .unwrap_or(tie_column);
    let sql = compose_page_sql(warehouse_section, &state, batch_number, inc_column, tie_column);
    debug!(sql = %sql, "Composed page query");

    let force_strings: HashSet<String> =
        warehouse_section.force_string_fields.iter().cloned().collect();
    let page = warehouse
        .query_all(&warehouse_section.project_id, &sql, &force_strings)
        .await?;

    engine
        .log(
            job,
            run_id,
            LogLevel::Info,
            "fetch",
            &format!("Fetched {} rows", page.len()),
            Some(json!({ "batch": batch_number, "rows": page.len() })),
        )
        .await?;

    // Upsert in sequential sub-batches, watching the deadline between them.
    let page_len = page.len();
    let mut consumed = 0usize;
    let mut deadline_hit = false;
    for sub_batch in page.chunks(UPSERT_SUB_BATCH) {
        sink.upsert(&sink_section.table, sub_batch, &sink_section.upsert_columns)
            .await?;
        consumed += sub_batch.len();

        if Instant::now() >= deadline && consumed < page_len {
            deadline_hit = true;
            break;
        }
    }

    engine
        .log(
            job,
            run_id,
            LogLevel::Info,
            "upsert",
            &format!("Upserted {consumed} rows"),
            None,
        )
        .await?;

    state.rows_processed += consumed as u64;

    let has_more = page_len == FETCH_LIMIT || deadline_hit;
    if has_more {
        // Advance the cursor to the last row actually consumed.
        let last_row: &Row = &page[consumed - 1];
        let cursor = CursorTuple::from_row(last_row, inc_column, tie_column);
        state.cursor = Some(cursor);
        engine.state_store().save(&job.id, run_id, &state).await?;

        engine
            .log(
                job,
                run_id,
                LogLevel::Info,
                "persist",
                &format!("Batch {batch_number} complete; continuing"),
                Some(json!({ "rowsProcessed": state.rows_processed, "deadlineHit": deadline_hit })),
            )
            .await?;

        return Ok(BatchResult {
            run_id: run_id.to_string(),
            has_more: true,
            next_batch: Some(batch_number + 1),
            rows_processed: consumed as u64,
            rows_deleted: 0,
            summary: None,
        });
    }

    // Terminal batch: detect deletions before reporting success.
    let rows_deleted = deletes::detect_and_delete(
        engine,
        job,
        run_id,
        warehouse_section,
        sink_section,
        &warehouse,
        &sink,
        &force_strings,
    )
    .await?;

    let summary = format_summary(state.rows_processed, rows_deleted, state.started_at);
    Ok(BatchResult {
        run_id: run_id.to_string(),
        has_more: false,
        next_batch: None,
        rows_processed: consumed as u64,
        rows_deleted,
        summary: Some(summary),
    })
}

/// Batch-1 schema reconciliation: snapshot the source schema, create the
/// sink table, validate upsert keys, apply drift, and seed the run state.
async fn reconcile(
    engine: &SyncEngine,
    job: &JobConfig,
    warehouse_section: &WarehouseSection,
    sink_section: &SinkSection,
    warehouse: &crate::warehouse::WarehouseClient,
    sink: &crate::sink::SinkClient,
    run_id: &str,
) -> Result<RunState, SyncError> {
    let source_fields = warehouse
        .get_metadata(
            &warehouse_section.project_id,
            &warehouse_section.dataset,
            &warehouse_section.table,
        )
        .await?;

    sink.exec_ddl(&schema::create_table_sql(&sink_section.table, &source_fields))
        .await?;

    let invalid = schema::validate_upsert_keys(&sink_section.upsert_columns, &source_fields);
    if !invalid.is_empty() {
        return Err(SyncError::config(format!(
            "upsert columns not in source schema: {}",
            invalid.join(", ")
        )));
    }

    sink.exec_ddl(&schema::unique_index_sql(
        &sink_section.table,
        &sink_section.upsert_columns,
    ))
    .await?;

    let sink_fields = sink.describe(&sink_section.table).await?;
    let changes = schema::detect_changes(&source_fields, &sink_fields);

    for field in &changes.to_add {
        sink.exec_ddl(&schema::add_column_sql(&sink_section.table, field))
            .await?;
    }
    for column in &changes.to_drop {
        sink.exec_ddl(&schema::drop_column_sql(&sink_section.table, column))
            .await?;
    }

    if !changes.is_empty() {
        engine
            .log(
                job,
                run_id,
                LogLevel::Info,
                "reconcile",
                "Applied schema drift",
                Some(json!({
                    "added": changes.to_add.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
                    "dropped": changes.to_drop,
                })),
            )
            .await?;
        sleep(SCHEMA_PROPAGATION_PAUSE).await;
    }

    let last_sync_value = match &warehouse_section.incremental_column {
        Some(column) => sink.last_value(&sink_section.table, column).await?,
        None => None,
    };

    info!(
        table = %sink_section.table,
        last_sync_value = ?last_sync_value,
        "Schema reconciled"
    );

    let state = RunState {
        last_sync_value,
        source_schema: source_fields,
        rows_processed: 0,
        started_at: Utc::now(),
        schema_sync_done: true,
        cursor: None,
    };
    engine.state_store().save(&job.id, run_id, &state).await?;

    engine
        .log(
            job,
            run_id,
            LogLevel::Info,
            "reconcile",
            "Schema synchronized",
            Some(json!({ "columns": state.source_schema.len() })),
        )
        .await?;

    Ok(state)
}

/// Composes the page query: last-sync filter, carried-cursor predicate,
/// composite ordering, and the batch limit.
fn compose_page_sql(
    warehouse_section: &WarehouseSection,
    state: &RunState,
    batch_number: u32,
    inc_column: &str,
    tie_column: &str,
) -> String {
    let table = format!(
        "{}.{}.{}",
        warehouse_section.project_id, warehouse_section.dataset, warehouse_section.table
    );

    let mut predicates = Vec::new();
    if warehouse_section.incremental_column.is_some()
        && let Some(last_sync_value) = &state.last_sync_value
    {
        predicates.push(incremental_filter(
            inc_column,
            warehouse_section.on_date_tie.operator(),
            last_sync_value,
        ));
    }
    if batch_number > 1
        && let Some(cursor) = &state.cursor
    {
        predicates.push(cursor_predicate(inc_column, tie_column, cursor));
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    format!(
        "SELECT * FROM {}{} {} LIMIT {}",
        warehouse_ident(&table),
        where_clause,
        order_clause(inc_column, tie_column),
        FETCH_LIMIT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::OnDateTie;
    use crate::schema::{Field, FieldType};
    use serde_json::json;

    fn section(incremental: Option<&str>) -> WarehouseSection {
        WarehouseSection {
            project_id: "proj".into(),
            dataset: "ds".into(),
            table: "events".into(),
            incremental_column: incremental.map(|s| s.to_string()),
            force_string_fields: vec![],
            on_date_tie: OnDateTie::Skip,
        }
    }

    fn state(last_sync_value: Option<serde_json::Value>, cursor: Option<CursorTuple>) -> RunState {
        RunState {
            last_sync_value,
            source_schema: vec![Field::new("id", FieldType::Int)],
            rows_processed: 0,
            started_at: Utc::now(),
            schema_sync_done: true,
            cursor,
        }
    }

    #[test]
    fn batch_one_uses_strict_filter_and_composite_order() {
        let sql = compose_page_sql(
            &section(Some("d")),
            &state(Some(json!("2024-01-01")), None),
            1,
            "d",
            "id",
        );
        assert_eq!(
            sql,
            "SELECT * FROM `proj.ds.events` WHERE `d` > '2024-01-01' \
             ORDER BY `d` ASC, `id` ASC LIMIT 5000"
        );
    }

    #[test]
    fn later_batches_append_the_cursor_predicate() {
        let cursor = CursorTuple {
            inc: json!("2024-01-03"),
            tie: json!(2),
        };
        let sql = compose_page_sql(
            &section(Some("d")),
            &state(Some(json!("2024-01-01")), Some(cursor)),
            2,
            "d",
            "id",
        );
        assert_eq!(
            sql,
            "SELECT * FROM `proj.ds.events` WHERE `d` > '2024-01-01' AND \
             ((`d` > '2024-01-03') OR (`d` = '2024-01-03' AND `id` > 2)) \
             ORDER BY `d` ASC, `id` ASC LIMIT 5000"
        );
    }

    #[test]
    fn empty_sink_omits_the_incremental_filter() {
        let sql = compose_page_sql(&section(Some("d")), &state(None, None), 1, "d", "id");
        assert_eq!(
            sql,
            "SELECT * FROM `proj.ds.events` ORDER BY `d` ASC, `id` ASC LIMIT 5000"
        );
    }

    #[test]
    fn no_incremental_column_orders_by_upsert_key() {
        let sql = compose_page_sql(&section(None), &state(None, None), 1, "id", "id");
        assert_eq!(
            sql,
            "SELECT * FROM `proj.ds.events` ORDER BY `id` ASC LIMIT 5000"
        );
    }

    #[test]
    fn no_incremental_column_resumes_with_compound_cursor() {
        let cursor = CursorTuple {
            inc: json!(2500),
            tie: json!(2500),
        };
        let sql = compose_page_sql(&section(None), &state(None, Some(cursor)), 2, "id", "id");
        assert_eq!(
            sql,
            "SELECT * FROM `proj.ds.events` WHERE \
             ((`id` > 2500) OR (`id` = 2500 AND `id` > 2500)) \
             ORDER BY `id` ASC LIMIT 5000"
        );
    }

    #[test]
    fn reprocess_policy_relaxes_the_operator() {
        let mut section = section(Some("d"));
        section.on_date_tie = OnDateTie::Reprocess;
        let sql = compose_page_sql(&section, &state(Some(json!("2024-01-01")), None), 1, "d", "id");
        assert!(sql.contains("`d` >= '2024-01-01'"));
    }
}
