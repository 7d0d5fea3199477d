//! Migration to create the kv_entries table.
//!
//! This migration creates the kv_entries table backing the service's opaque
//! key/value namespaces: job configurations, per-run resumption state, run
//! logs, and the per-job run index. Entries may carry an expiry timestamp;
//! expired entries are invisible to readers and garbage-collected lazily.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(KvEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(KvEntries::Key)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(KvEntries::Value).json_binary().not_null())
                    .col(
                        ColumnDef::new(KvEntries::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(KvEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for prefix scans over a namespace (e.g. all `job:` keys)
        manager
            .create_index(
                Index::create()
                    .name("idx_kv_entries_expires_at")
                    .table(KvEntries::Table)
                    .col(KvEntries::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_kv_entries_expires_at").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(KvEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum KvEntries {
    Table,
    Key,
    Value,
    ExpiresAt,
    UpdatedAt,
}
