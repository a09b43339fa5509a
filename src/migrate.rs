//! Idempotent schema migrations for the embedding index database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the index tables if they do not exist. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply migrations on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per embedded table or column. `column_name` is '' for table
    // rows so the primary key stays NOT NULL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_records (
            kind TEXT NOT NULL,
            table_name TEXT NOT NULL,
            column_name TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            model TEXT NOT NULL,
            embedded_at INTEGER NOT NULL,
            PRIMARY KEY (kind, table_name, column_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_schema_records_table ON schema_records(table_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_schema_records_kind ON schema_records(kind)")
        .execute(pool)
        .await?;

    Ok(())
}
