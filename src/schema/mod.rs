//! # Schema Reconciler
//!
//! Field/type model shared by the source and sink clients, plus the
//! reconciliation logic: schema-drift detection, upsert-key validation,
//! type mapping, and DDL generation for the sink.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Column added to every mirrored table and owned by the engine; it is
/// excluded from drift detection and sink descriptions.
pub const SYNCED_AT_COLUMN: &str = "synced_at";

/// A row as it travels from source to sink: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

/// Source-typed column classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Date,
    Datetime,
    Timestamp,
    Numeric,
}

impl FieldType {
    /// Maps a warehouse type name onto a typed class. Unknown types are
    /// treated as strings.
    pub fn from_warehouse(type_name: &str) -> Self {
        match type_name.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT64" => FieldType::Int,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "BOOLEAN" | "BOOL" => FieldType::Bool,
            "DATE" => FieldType::Date,
            "DATETIME" => FieldType::Datetime,
            "TIMESTAMP" => FieldType::Timestamp,
            "NUMERIC" | "BIGNUMERIC" => FieldType::Numeric,
            _ => FieldType::String,
        }
    }

    /// The sink column type this class maps onto.
    pub fn sink_type(&self) -> &'static str {
        match self {
            FieldType::String => "TEXT",
            FieldType::Int => "BIGINT",
            FieldType::Float => "DOUBLE PRECISION",
            FieldType::Bool => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Datetime => "TIMESTAMP",
            FieldType::Timestamp => "TIMESTAMPTZ",
            FieldType::Numeric => "NUMERIC",
        }
    }

    /// Maps an information-schema data type back onto a typed class.
    pub fn from_sink_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "bigint" | "integer" | "smallint" => FieldType::Int,
            "double precision" | "real" => FieldType::Float,
            "boolean" => FieldType::Bool,
            "date" => FieldType::Date,
            "timestamp without time zone" => FieldType::Datetime,
            "timestamp with time zone" | "timestamptz" => FieldType::Timestamp,
            "numeric" => FieldType::Numeric,
            _ => FieldType::String,
        }
    }

    /// The warehouse type name for this class (used by load-job schemas).
    pub fn warehouse_type(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Int => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Bool => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Datetime => "DATETIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Numeric => "NUMERIC",
        }
    }
}

/// One column of a source or sink schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// Result of comparing a source schema snapshot against the sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaChanges {
    /// Source columns missing from the sink.
    pub to_add: Vec<Field>,
    /// Sink columns no longer present in the source.
    pub to_drop: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_drop.is_empty()
    }
}

/// Compares source and sink schemas by case-insensitive column name.
///
/// The engine-owned `synced_at` column is never reported as drift.
pub fn detect_changes(source_fields: &[Field], sink_fields: &[Field]) -> SchemaChanges {
    let source_names: Vec<String> = source_fields
        .iter()
        .map(|f| f.name.to_lowercase())
        .collect();
    let sink_names: Vec<String> = sink_fields.iter().map(|f| f.name.to_lowercase()).collect();

    let to_add = source_fields
        .iter()
        .filter(|field| !sink_names.contains(&field.name.to_lowercase()))
        .cloned()
        .collect();

    let to_drop = sink_fields
        .iter()
        .filter(|field| {
            let lower = field.name.to_lowercase();
            lower != SYNCED_AT_COLUMN && !source_names.contains(&lower)
        })
        .map(|field| field.name.clone())
        .collect();

    SchemaChanges { to_add, to_drop }
}

/// Validates that every declared upsert column exists in the source schema
/// (case-insensitive). Returns the invalid names on failure.
pub fn validate_upsert_keys(upsert_columns: &[String], source_fields: &[Field]) -> Vec<String> {
    let source_names: Vec<String> = source_fields
        .iter()
        .map(|f| f.name.to_lowercase())
        .collect();

    upsert_columns
        .iter()
        .filter(|column| !source_names.contains(&column.to_lowercase()))
        .cloned()
        .collect()
}

/// Quotes an identifier for the sink, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Generates the CREATE TABLE statement for a mirrored table, including the
/// engine-owned `synced_at` column.
pub fn create_table_sql(table: &str, fields: &[Field]) -> String {
    let mut columns: Vec<String> = fields
        .iter()
        .map(|field| format!("{} {}", quote_ident(&field.name), field.field_type.sink_type()))
        .collect();
    columns.push(format!(
        "{} TIMESTAMPTZ DEFAULT now()",
        quote_ident(SYNCED_AT_COLUMN)
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

/// Generates the uniqueness constraint backing upserts, named
/// `<table>_unique_idx`, created only if absent.
pub fn unique_index_sql(table: &str, upsert_columns: &[String]) -> String {
    let columns = upsert_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{table}_unique_idx")),
        quote_ident(table),
        columns
    )
}

/// Generates the ALTER TABLE statement adding one drifted column.
pub fn add_column_sql(table: &str, field: &Field) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_ident(table),
        quote_ident(&field.name),
        field.field_type.sink_type()
    )
}

/// Generates the ALTER TABLE statement dropping one drifted column.
pub fn drop_column_sql(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
        quote_ident(table),
        quote_ident(column)
    )
}
