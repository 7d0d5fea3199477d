//! End-to-end engine scenarios against mock warehouse and sink servers.

mod common;

use std::sync::Arc;

use serde_json::{Value as JsonValue, json};
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use mirrorsync::runlog::LogLevel;
use mirrorsync::store::{KvStore, MemoryKvStore};

const ORDER_FIELDS: &[(&str, &str)] = &[("id", "INTEGER"), ("d", "DATE"), ("v", "INTEGER")];

async fn mount_warehouse_metadata(server: &MockServer, fields: &[(&str, &str)]) {
    Mock::given(method("GET"))
        .and(path("/bigquery/v2/projects/proj/datasets/ds/tables/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(table_resource(fields)))
        .mount(server)
        .await;
}

async fn mount_sink_ddl(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_ddl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
        .mount(server)
        .await;
}

async fn mount_sink_describe(server: &MockServer, columns: &[(&str, &str)]) {
    let rows: Vec<JsonValue> = columns
        .iter()
        .map(|(name, data_type)| {
            json!({ "column_name": name, "data_type": data_type, "is_nullable": "YES" })
        })
        .collect();

    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_sql"))
        .and(body_string_contains("information_schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(rows)))
        .mount(server)
        .await;
}

async fn mount_sink_last_value(server: &MockServer, value: JsonValue) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_sql"))
        .and(body_string_contains("SELECT MAX"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "value": value }])))
        .mount(server)
        .await;
}

async fn mount_sink_key_scan(server: &MockServer, rows: Vec<JsonValue>) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/rpc/exec_sql"))
        .and(body_string_contains("OFFSET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(rows)))
        .mount(server)
        .await;
}

async fn mount_sink_upsert(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/orders"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

fn order_row(id: i64, date: &str, value: i64) -> Vec<JsonValue> {
    vec![
        json!(id.to_string()),
        json!(date),
        json!(value.to_string()),
    ]
}

/// Scenario: simple incremental run finishing in one batch.
#[tokio::test]
async fn simple_incremental_one_batch() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, ORDER_FIELDS).await;
    mount_sink_ddl(&sink).await;
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!(null)).await;
    mount_sink_upsert(&sink).await;

    // Page query returns both rows; the delete-scan key query returns the
    // same keys so nothing is deleted.
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT *"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            vec![order_row(1, "2024-01-01", 10), order_row(2, "2024-01-02", 20)],
            None,
        )))
        .mount(&warehouse)
        .await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT `id` FROM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            &[("id", "INTEGER")],
            vec![vec![json!("1")], vec![json!("2")]],
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(&sink, vec![json!({ "id": 1 }), json!({ "id": 2 })]).await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let result = engine.run_batch(&job, None, 1).await.unwrap();

    assert!(!result.has_more);
    assert_eq!(result.rows_processed, 2);
    assert_eq!(result.rows_deleted, 0);
    assert!(result.summary.as_deref().unwrap().starts_with("2 rows synced in"));

    // Upsert carried the conflict columns and both rows.
    let requests = sink.received_requests().await.unwrap();
    let upsert = requests
        .iter()
        .find(|r| r.url.path() == "/rest/v1/orders" && r.method.as_str() == "POST")
        .expect("upsert request");
    assert!(upsert.url.query().unwrap().contains("on_conflict=id"));
    let body: JsonValue = serde_json::from_slice(&upsert.body).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["id"], json!(1));
    assert_eq!(body[0]["d"], json!("2024-01-01"));

    // Job bookkeeping reflects the success.
    let stored: mirrorsync::jobs::JobConfig = serde_json::from_value(
        kv.get("job:job-orders").await.unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(stored.last_status, Some(mirrorsync::jobs::RunStatus::Success));
    assert!(stored.last_error.is_none());
    assert!(stored.last_summary.unwrap().starts_with("2 rows synced"));
}

/// Scenario: a full page continues the run and batch 2 resumes through the
/// compound cursor predicate, with ties on the incremental column.
#[tokio::test]
async fn ties_resume_through_compound_cursor() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, ORDER_FIELDS).await;
    mount_sink_ddl(&sink).await;
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!(null)).await;
    mount_sink_upsert(&sink).await;

    // Batch 1: a full page of 5000 rows, every one tied on the same date.
    let full_page: Vec<Vec<JsonValue>> = (1..=5000)
        .map(|id| order_row(id, "2024-01-03", id * 10))
        .collect();
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT *"))
        .and(body_string_contains("ORDER BY `d` ASC, `id` ASC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            full_page,
            None,
        )))
        .up_to_n_times(1)
        .mount(&warehouse)
        .await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let first = engine.run_batch(&job, None, 1).await.unwrap();
    assert!(first.has_more);
    assert_eq!(first.next_batch, Some(2));
    assert_eq!(first.rows_processed, 5000);

    // Batch 2 must carry the cursor predicate for the tied date.
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains(
            "((`d` > '2024-01-03') OR (`d` = '2024-01-03' AND `id` > 5000))",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            vec![
                order_row(5001, "2024-01-03", 1),
                order_row(5002, "2024-01-03", 2),
            ],
            None,
        )))
        .mount(&warehouse)
        .await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT `id` FROM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            &[("id", "INTEGER")],
            (1..=5002).map(|id: i64| vec![json!(id.to_string())]).collect(),
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(
        &sink,
        (1..=5002).map(|id| json!({ "id": id })).collect(),
    )
    .await;

    let second = engine
        .run_batch(&job, Some(first.run_id.clone()), 2)
        .await
        .unwrap();

    assert!(!second.has_more);
    assert_eq!(second.rows_processed, 2);
    assert!(second.summary.as_deref().unwrap().starts_with("5002 rows synced"));

    // The run state is gone after the terminal batch.
    assert!(
        kv.get(&format!("sync_state:job-orders:{}", first.run_id))
            .await
            .unwrap()
            .is_none()
    );
}

/// Scenario: a source scope regression trips the runaway-delete breaker and
/// leaves the sink untouched.
#[tokio::test]
async fn source_regression_trips_gate_c() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, ORDER_FIELDS).await;
    mount_sink_ddl(&sink).await;
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!(null)).await;
    mount_sink_upsert(&sink).await;

    // Source now holds only 400 keys; the sink mirrors 1000 rows.
    let source_rows: Vec<Vec<JsonValue>> =
        (1..=400).map(|id| order_row(id, "2024-01-01", id)).collect();
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT *"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            source_rows,
            None,
        )))
        .mount(&warehouse)
        .await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT `id` FROM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            &[("id", "INTEGER")],
            (1..=400).map(|id: i64| vec![json!(id.to_string())]).collect(),
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(&sink, (1..=1000).map(|id| json!({ "id": id })).collect()).await;

    // Any DELETE against the sink would violate the breaker.
    Mock::given(method("DELETE"))
        .and(path_regex("/rest/v1/.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&sink)
        .await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let err = engine.run_batch(&job, None, 1).await.unwrap_err();
    assert_eq!(err.kind(), "DestructiveAnomaly");

    let stored: mirrorsync::jobs::JobConfig = serde_json::from_value(
        kv.get("job:job-orders").await.unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(stored.last_status, Some(mirrorsync::jobs::RunStatus::Error));
    assert!(stored.last_error.unwrap().contains("destructive anomaly"));
}

/// Scenario: an empty source trips the source-empty breaker with a warning
/// and the run still succeeds with zero deletions.
#[tokio::test]
async fn empty_source_trips_gate_a() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, ORDER_FIELDS).await;
    mount_sink_ddl(&sink).await;
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!("2024-01-05")).await;
    mount_sink_upsert(&sink).await;

    // Both the page query and the key scan come back empty.
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            vec![],
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(&sink, (1..=50).map(|id| json!({ "id": id })).collect()).await;

    Mock::given(method("DELETE"))
        .and(path_regex("/rest/v1/.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&sink)
        .await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let result = engine.run_batch(&job, None, 1).await.unwrap();

    assert!(!result.has_more);
    assert_eq!(result.rows_deleted, 0);
    assert!(result.summary.as_deref().unwrap().starts_with("0 rows synced in"));

    // The delete phase logged its warning.
    let entries = engine
        .logger()
        .read("job-orders", &result.run_id, None)
        .await
        .unwrap();
    assert!(entries.iter().any(|entry| {
        entry.level == LogLevel::Warning && entry.message.contains("skipping delete detection")
    }));
}

/// Scenario: stale sink rows are deleted once the gates pass.
#[tokio::test]
async fn stale_sink_rows_are_deleted() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, ORDER_FIELDS).await;
    mount_sink_ddl(&sink).await;
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!(null)).await;
    mount_sink_upsert(&sink).await;

    // Source holds 9 keys; the sink still mirrors 10.
    let source_rows: Vec<Vec<JsonValue>> =
        (1..=9).map(|id| order_row(id, "2024-01-01", id)).collect();
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT *"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            ORDER_FIELDS,
            source_rows,
            None,
        )))
        .mount(&warehouse)
        .await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT `id` FROM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            &[("id", "INTEGER")],
            (1..=9).map(|id: i64| vec![json!(id.to_string())]).collect(),
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(&sink, (1..=10).map(|id| json!({ "id": id })).collect()).await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/orders"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("content-range", "0-0/1"),
        )
        .expect(1)
        .mount(&sink)
        .await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let result = engine.run_batch(&job, None, 1).await.unwrap();

    assert!(!result.has_more);
    assert_eq!(result.rows_deleted, 1);
    assert!(result.summary.as_deref().unwrap().contains("1 deleted"));

    let requests = sink.received_requests().await.unwrap();
    let delete = requests
        .iter()
        .find(|r| r.method.as_str() == "DELETE")
        .expect("delete request");
    assert!(delete.url.query().unwrap().contains("in."));
}

/// Scenario: schema drift in the source becomes ADD COLUMN DDL on the sink.
#[tokio::test]
async fn schema_drift_adds_columns() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    let drifted_fields: &[(&str, &str)] = &[
        ("id", "INTEGER"),
        ("d", "DATE"),
        ("v", "INTEGER"),
        ("note", "STRING"),
    ];

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, drifted_fields).await;
    mount_sink_ddl(&sink).await;
    // The sink still has the old shape: no `note` column.
    mount_sink_describe(&sink, &[("id", "bigint"), ("d", "date"), ("v", "bigint")]).await;
    mount_sink_last_value(&sink, json!(null)).await;
    mount_sink_upsert(&sink).await;

    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT *"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            drifted_fields,
            vec![vec![json!("1"), json!("2024-01-01"), json!("10"), json!("hello")]],
            None,
        )))
        .mount(&warehouse)
        .await;
    Mock::given(method("POST"))
        .and(path("/bigquery/v2/projects/proj/queries"))
        .and(body_string_contains("SELECT `id` FROM"))
        .respond_with(ResponseTemplate::new(200).set_body_json(query_response(
            &[("id", "INTEGER")],
            vec![vec![json!("1")]],
            None,
        )))
        .mount(&warehouse)
        .await;
    mount_sink_key_scan(&sink, vec![json!({ "id": 1 })]).await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let result = engine.run_batch(&job, None, 1).await.unwrap();
    assert!(!result.has_more);

    let requests = sink.received_requests().await.unwrap();
    let ddl_bodies: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path() == "/rest/v1/rpc/exec_ddl")
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .collect();

    assert!(ddl_bodies.iter().any(|body| {
        body.contains("ALTER TABLE \\\"orders\\\" ADD COLUMN IF NOT EXISTS \\\"note\\\" TEXT")
    }));

    // Upserted rows carry the new column.
    let upsert = requests
        .iter()
        .find(|r| r.url.path() == "/rest/v1/orders" && r.method.as_str() == "POST")
        .expect("upsert request");
    let body: JsonValue = serde_json::from_slice(&upsert.body).unwrap();
    assert_eq!(body[0]["note"], json!("hello"));
}

/// Scenario: a missing run state on a later batch fails with RunExpired.
#[tokio::test]
async fn missing_state_is_run_expired() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let err = engine
        .run_batch(&job, Some("ghost-run".to_string()), 2)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "RunExpired");
}

/// Scenario: upsert keys missing from the source schema fail fast.
#[tokio::test]
async fn invalid_upsert_keys_are_config_errors() {
    let warehouse = MockServer::start().await;
    let sink = MockServer::start().await;
    let kv = Arc::new(MemoryKvStore::new());

    mount_token_endpoint(&warehouse).await;
    mount_warehouse_metadata(&warehouse, &[("d", "DATE"), ("v", "INTEGER")]).await;
    mount_sink_ddl(&sink).await;

    let job = warehouse_job(Some("d"));
    seed_job(&kv, &job).await;
    let engine = engine_for(&warehouse, &sink, None, kv.clone());

    let err = engine.run_batch(&job, None, 1).await.unwrap_err();
    assert_eq!(err.kind(), "ConfigInvalid");
    assert!(err.to_string().contains("id"));
}
