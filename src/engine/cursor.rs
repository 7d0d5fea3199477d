//! Composite cursor for cross-invocation resumption.
//!
//! A cursor records the `(incremental column, tie-breaker)` values of the
//! last row a batch consumed. Resumption appends the compound predicate
//! `((inc > v1) OR (inc = v1 AND tie > v2))` so ties on the incremental
//! column never repeat or skip rows.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Resumption position carried between batches of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorTuple {
    /// Value of the incremental column (or the first upsert column when the
    /// job has no incremental column).
    pub inc: JsonValue,
    /// Value of the tie-breaker: always the first upsert column.
    pub tie: JsonValue,
}

impl CursorTuple {
    /// Reads the cursor off the last row of a page.
    pub fn from_row(row: &crate::schema::Row, inc_column: &str, tie_column: &str) -> Self {
        Self {
            inc: row.get(inc_column).cloned().unwrap_or(JsonValue::Null),
            tie: row.get(tie_column).cloned().unwrap_or(JsonValue::Null),
        }
    }
}

/// Renders a JSON value as a warehouse SQL literal, doubling embedded
/// single quotes in strings.
pub fn sql_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => format!("'{}'", text.replace('\'', "''")),
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}

/// Quotes a warehouse identifier.
pub fn warehouse_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', ""))
}

/// Builds the `inc <op> value` filter applied from the last-sync value.
pub fn incremental_filter(inc_column: &str, operator: &str, last_sync_value: &JsonValue) -> String {
    format!(
        "{} {} {}",
        warehouse_ident(inc_column),
        operator,
        sql_literal(last_sync_value)
    )
}

/// Builds the compound cursor predicate used to resume under ties.
pub fn cursor_predicate(inc_column: &str, tie_column: &str, cursor: &CursorTuple) -> String {
    let inc = warehouse_ident(inc_column);
    let tie = warehouse_ident(tie_column);
    format!(
        "(({inc} > {v1}) OR ({inc} = {v1} AND {tie} > {v2}))",
        v1 = sql_literal(&cursor.inc),
        v2 = sql_literal(&cursor.tie),
    )
}

/// Builds the ORDER BY clause imposing the total order across batches.
pub fn order_clause(inc_column: &str, tie_column: &str) -> String {
    if inc_column == tie_column {
        format!("ORDER BY {} ASC", warehouse_ident(tie_column))
    } else {
        format!(
            "ORDER BY {} ASC, {} ASC",
            warehouse_ident(inc_column),
            warehouse_ident(tie_column)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literals_escape_single_quotes() {
        assert_eq!(sql_literal(&json!("o'neil")), "'o''neil'");
        assert_eq!(sql_literal(&json!(42)), "42");
        assert_eq!(sql_literal(&json!(null)), "NULL");
        assert_eq!(sql_literal(&json!(true)), "TRUE");
    }

    #[test]
    fn compound_predicate_matches_contract() {
        let cursor = CursorTuple {
            inc: json!("2024-01-03"),
            tie: json!(2),
        };
        assert_eq!(
            cursor_predicate("d", "id", &cursor),
            "((`d` > '2024-01-03') OR (`d` = '2024-01-03' AND `id` > 2))"
        );
    }

    #[test]
    fn order_clause_collapses_when_columns_match() {
        assert_eq!(order_clause("id", "id"), "ORDER BY `id` ASC");
        assert_eq!(order_clause("d", "id"), "ORDER BY `d` ASC, `id` ASC");
    }

    #[test]
    fn cursor_reads_from_last_row() {
        let mut row = crate::schema::Row::new();
        row.insert("d".into(), json!("2024-01-03"));
        row.insert("id".into(), json!(2));

        let cursor = CursorTuple::from_row(&row, "d", "id");
        assert_eq!(cursor.inc, json!("2024-01-03"));
        assert_eq!(cursor.tie, json!(2));
    }
}
