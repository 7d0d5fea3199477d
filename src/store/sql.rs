//! SeaORM-backed key/value store.
//!
//! Persists entries in the `kv_entries` table created by the migration
//! crate. Expiry is enforced on read; `purge_expired` removes dead rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set,
};
use serde_json::Value as JsonValue;

use super::{KvError, KvStore};
use crate::models::kv_entry::{ActiveModel, Column, Entity as KvEntry};

/// [`KvStore`] implementation over the service database.
#[derive(Clone)]
pub struct SqlKvStore {
    db: DatabaseConnection,
}

impl SqlKvStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn to_db_time(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
    dt.fixed_offset()
}

fn unexpired(now: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(Column::ExpiresAt.is_null())
        .add(Column::ExpiresAt.gt(to_db_time(now)))
}

fn map_db_err(err: sea_orm::DbErr) -> KvError {
    KvError::Backend(err.to_string())
}

#[async_trait]
impl KvStore for SqlKvStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, KvError> {
        let entry = KvEntry::find_by_id(key.to_string())
            .filter(unexpired(Utc::now()))
            .one(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(entry.map(|model| model.value))
    }

    async fn put(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), KvError> {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| {
            to_db_time(
                now + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24)),
            )
        });

        let model = ActiveModel {
            key: Set(key.to_string()),
            value: Set(value),
            expires_at: Set(expires_at),
            updated_at: Set(to_db_time(now)),
        };

        KvEntry::insert(model)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .update_columns([Column::Value, Column::ExpiresAt, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let result = KvEntry::delete_by_id(key.to_string())
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected > 0)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let keys: Vec<String> = KvEntry::find()
            .select_only()
            .column(Column::Key)
            .filter(Column::Key.starts_with(prefix))
            .filter(unexpired(Utc::now()))
            .order_by_asc(Column::Key)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64, KvError> {
        let result = KvEntry::delete_many()
            .filter(Column::ExpiresAt.lte(to_db_time(Utc::now())))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn store() -> SqlKvStore {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("create in-memory db");
        Migrator::up(&db, None).await.expect("apply migrations");
        SqlKvStore::new(db)
    }

    #[tokio::test]
    async fn put_overwrites_and_get_reads_back() {
        let store = store().await;

        store
            .put("job:1", serde_json::json!({"v": 1}), None)
            .await
            .unwrap();
        store
            .put("job:1", serde_json::json!({"v": 2}), None)
            .await
            .unwrap();

        let value = store.get("job:1").await.unwrap().unwrap();
        assert_eq!(value["v"], 2);
    }

    #[tokio::test]
    async fn expired_rows_are_hidden_and_purged() {
        let store = store().await;

        store
            .put(
                "logs:j:r",
                serde_json::json!([]),
                Some(Duration::from_secs(0)),
            )
            .await
            .unwrap();
        store
            .put("logs:j:latest", serde_json::json!({}), None)
            .await
            .unwrap();

        assert!(store.get("logs:j:r").await.unwrap().is_none());
        assert_eq!(store.list_keys("logs:j:").await.unwrap(), vec![
            "logs:j:latest".to_string()
        ]);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
