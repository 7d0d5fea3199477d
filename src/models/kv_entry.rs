//! KvEntry entity model
//!
//! This module contains the SeaORM entity model for the kv_entries table,
//! the single table backing every key/value namespace the service persists:
//! job configurations, run state, run logs, and run indexes.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// KvEntry entity representing one opaque key/value record
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "kv_entries")]
pub struct Model {
    /// Namespaced key, e.g. `job:{id}` or `sync_state:{jobId}:{runId}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Stored document
    #[sea_orm(column_type = "JsonBinary")]
    pub value: JsonValue,

    /// Expiry timestamp; entries past this instant are invisible to readers
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Timestamp of the last write
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
