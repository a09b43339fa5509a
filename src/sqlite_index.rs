//! SQLite-backed [`EmbeddingIndex`].
//!
//! Records live in `schema_records` with vectors stored as little-endian
//! `f32` BLOBs. The index dimension and the schema version it was built
//! for are kept in `index_meta`. Every write method runs in a single
//! transaction, so readers see a table either entirely before or entirely
//! after a replace.
//!
//! Search is exact: candidate rows are filtered by kind and table scope in
//! SQL, then scored with cosine similarity in Rust.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use schema_linker_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use schema_linker_core::index::{
    check_batch_dims, check_table_ownership, rank, ElementKind, EmbeddingIndex, EmbeddingRecord,
    ScoredRecord, SearchQuery,
};
use schema_linker_core::{LinkError, Result};

use crate::config::Config;
use crate::{db, migrate};

const META_DIMS: &str = "dims";
const META_SCHEMA_VERSION: &str = "schema_version";

/// SQLite implementation of the [`EmbeddingIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Wrap a pool whose database has been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database, creating tables if needed.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn storage(e: impl std::fmt::Display) -> LinkError {
    LinkError::Storage(e.to_string())
}

async fn read_meta(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(conn)
        .await
        .map_err(storage)
}

async fn write_meta(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO index_meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn stored_dims(conn: &mut SqliteConnection) -> Result<Option<usize>> {
    match read_meta(conn, META_DIMS).await? {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| LinkError::Storage(format!("corrupt index dimension '{v}'"))),
        None => Ok(None),
    }
}

async fn insert_records(conn: &mut SqliteConnection, records: &[EmbeddingRecord]) -> Result<()> {
    for record in records {
        let metadata = serde_json::to_string(&record.metadata).map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO schema_records (kind, table_name, column_name, text, embedding, dims,
                                        metadata_json, model, embedded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, table_name, column_name) DO UPDATE SET
                text = excluded.text,
                embedding = excluded.embedding,
                dims = excluded.dims,
                metadata_json = excluded.metadata_json,
                model = excluded.model,
                embedded_at = excluded.embedded_at
            "#,
        )
        .bind(record.kind.as_str())
        .bind(&record.table)
        .bind(record.column.as_deref().unwrap_or(""))
        .bind(&record.text)
        .bind(vec_to_blob(&record.vector))
        .bind(record.vector.len() as i64)
        .bind(metadata)
        .bind(&record.model)
        .bind(record.embedded_at)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    }
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<EmbeddingRecord> {
    let kind_str: String = row.try_get("kind").map_err(storage)?;
    let kind = ElementKind::parse(&kind_str)
        .ok_or_else(|| LinkError::Storage(format!("unknown record kind '{kind_str}'")))?;
    let column: String = row.try_get("column_name").map_err(storage)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(storage)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(storage)?;

    Ok(EmbeddingRecord {
        kind,
        table: row.try_get("table_name").map_err(storage)?,
        column: match kind {
            ElementKind::Table => None,
            ElementKind::Column => Some(column),
        },
        text: row.try_get("text").map_err(storage)?,
        vector: blob_to_vec(&blob),
        metadata: serde_json::from_str(&metadata_json).map_err(storage)?,
        model: row.try_get("model").map_err(storage)?,
        embedded_at: row.try_get("embedded_at").map_err(storage)?,
    })
}

#[async_trait]
impl EmbeddingIndex for SqliteIndex {
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let stored = stored_dims(&mut tx).await?;
        if let Some(dims) = check_batch_dims(&records, stored)? {
            write_meta(&mut tx, META_DIMS, &dims.to_string()).await?;
        }
        insert_records(&mut tx, &records).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn replace_table(&self, table: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
        check_table_ownership(table, &records)?;
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let stored = stored_dims(&mut tx).await?;
        let dims = check_batch_dims(&records, stored)?;

        sqlx::query("DELETE FROM schema_records WHERE table_name = ?")
            .bind(table)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if let Some(dims) = dims {
            write_meta(&mut tx, META_DIMS, &dims.to_string()).await?;
        }
        insert_records(&mut tx, &records).await?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM schema_records WHERE table_name = ?")
            .bind(table)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM schema_records")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM index_meta")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<ScoredRecord>> {
        query.validate()?;
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        let Some(dims) = stored_dims(&mut conn).await? else {
            return Ok(Vec::new());
        };
        if query.vector.len() != dims {
            return Err(LinkError::DimensionMismatch {
                expected: dims,
                actual: query.vector.len(),
            });
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT kind, table_name, column_name, text, embedding, metadata_json, model, embedded_at \
             FROM schema_records WHERE kind = ",
        );
        qb.push_bind(query.kind.as_str());
        if let Some(scope) = query.table_scope {
            if scope.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND table_name IN (");
            let mut separated = qb.separated(", ");
            for table in scope {
                separated.push_bind(table.as_str());
            }
            separated.push_unseparated(")");
        }

        let rows = qb.build().fetch_all(&mut *conn).await.map_err(storage)?;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            candidates.push(ScoredRecord {
                similarity: cosine_similarity(query.vector, &record.vector),
                record,
            });
        }

        Ok(rank(candidates, query))
    }

    async fn dims(&self) -> Result<Option<usize>> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        stored_dims(&mut conn).await
    }

    async fn tables(&self) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT DISTINCT table_name FROM schema_records")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(names.into_iter().collect())
    }

    async fn count(&self, kind: ElementKind) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_records WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(n as usize)
    }

    async fn record(
        &self,
        kind: ElementKind,
        table: &str,
        column: Option<&str>,
    ) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT kind, table_name, column_name, text, embedding, metadata_json, model, embedded_at \
             FROM schema_records WHERE kind = ? AND table_name = ? AND column_name = ?",
        )
        .bind(kind.as_str())
        .bind(table)
        .bind(column.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        read_meta(&mut conn, META_SCHEMA_VERSION).await
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        write_meta(&mut conn, META_SCHEMA_VERSION, version).await
    }
}
