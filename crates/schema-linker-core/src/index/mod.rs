//! Embedding index abstraction.
//!
//! The [`EmbeddingIndex`] trait defines the storage operations the filter
//! and precompute pipelines need, so that in-memory, SQLite, or other
//! backends are interchangeable.
//!
//! Records are keyed by `(kind, table, column)` and always replaced whole.
//! All vectors in an index share one dimension; writes that would break
//! this fail with [`LinkError::DimensionMismatch`].
//!
//! # Search policy
//!
//! [`rank`] implements the retrieval policy shared by every backend: a
//! candidate must clear the similarity threshold AND be within the top-K.
//! Ties are broken by table name, then column name, so the result never
//! depends on insertion order. A threshold of `0.0` disables the threshold
//! entirely (negative cosine scores included).

pub mod memory;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LinkError, Result};
use crate::schema::{ColumnNode, TableNode};

/// The kind of schema element a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Table,
    Column,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Table => "table",
            ElementKind::Column => "column",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(ElementKind::Table),
            "column" => Some(ElementKind::Column),
            _ => None,
        }
    }
}

/// Identity of a record inside the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: ElementKind,
    pub table: String,
    pub column: Option<String>,
}

/// One embedded table or column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub kind: ElementKind,
    pub table: String,
    /// `None` for table records.
    pub column: Option<String>,
    /// The exact text that was embedded.
    pub text: String,
    pub vector: Vec<f32>,
    /// Element metadata (`primary_key` and `type` for columns).
    pub metadata: Map<String, Value>,
    /// Model that produced `vector`.
    pub model: String,
    /// Unix timestamp (seconds) of when the vector was produced.
    pub embedded_at: i64,
}

impl EmbeddingRecord {
    pub fn for_table(table: &TableNode, vector: Vec<f32>, model: &str) -> Self {
        Self {
            kind: ElementKind::Table,
            table: table.name.clone(),
            column: None,
            text: table.embedding_text(),
            vector,
            metadata: Map::new(),
            model: model.to_string(),
            embedded_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn for_column(
        table: &TableNode,
        column: &ColumnNode,
        vector: Vec<f32>,
        model: &str,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("primary_key".to_string(), Value::Bool(column.primary_key));
        metadata.insert("type".to_string(), Value::String(column.data_type.clone()));
        Self {
            kind: ElementKind::Column,
            table: table.name.clone(),
            column: Some(column.name.clone()),
            text: table.column_text(column),
            vector,
            metadata,
            model: model.to_string(),
            embedded_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            kind: self.kind,
            table: self.table.clone(),
            column: self.column.clone(),
        }
    }

    pub fn is_primary_key(&self) -> bool {
        self.metadata
            .get("primary_key")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A record with its similarity to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: EmbeddingRecord,
    pub similarity: f32,
}

/// Parameters for a nearest-neighbor search.
#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    pub vector: &'a [f32],
    pub kind: ElementKind,
    pub top_k: usize,
    /// Minimum cosine similarity, in `[0, 1]`.
    pub threshold: f32,
    /// Restrict candidates to these tables.
    pub table_scope: Option<&'a BTreeSet<String>>,
}

impl SearchQuery<'_> {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(LinkError::config("top_k must be > 0"));
        }
        validate_threshold(self.threshold)
    }

    /// Whether a record is a candidate for this query (kind and scope).
    pub fn admits(&self, record: &EmbeddingRecord) -> bool {
        record.kind == self.kind
            && self
                .table_scope
                .map_or(true, |scope| scope.contains(&record.table))
    }
}

pub fn validate_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(LinkError::config(format!(
            "similarity threshold must be in [0, 1], got {threshold}"
        )));
    }
    Ok(())
}

/// Apply the threshold-and-top-K policy and the deterministic ordering.
pub fn rank(mut candidates: Vec<ScoredRecord>, query: &SearchQuery<'_>) -> Vec<ScoredRecord> {
    if query.threshold > 0.0 {
        candidates.retain(|c| c.similarity >= query.threshold);
    }
    candidates.sort_by(compare_scored);
    candidates.truncate(query.top_k);
    candidates
}

fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.record.table.cmp(&b.record.table))
        .then_with(|| a.record.column.cmp(&b.record.column))
}

/// Check that a batch of records agrees on one dimension, and with `stored`.
///
/// Returns the batch dimension (`None` for an empty batch).
pub fn check_batch_dims(records: &[EmbeddingRecord], stored: Option<usize>) -> Result<Option<usize>> {
    let mut expected = stored;
    for record in records {
        let actual = record.vector.len();
        match expected {
            Some(dims) if dims != actual => {
                return Err(LinkError::DimensionMismatch {
                    expected: dims,
                    actual,
                })
            }
            Some(_) => {}
            None => expected = Some(actual),
        }
    }
    Ok(if records.is_empty() { None } else { expected })
}

/// Check that every record of a table replacement belongs to `table`.
pub fn check_table_ownership(table: &str, records: &[EmbeddingRecord]) -> Result<()> {
    match records.iter().find(|r| r.table != table) {
        Some(r) => Err(LinkError::config(format!(
            "record for table '{}' passed to replace_table('{}')",
            r.table, table
        ))),
        None => Ok(()),
    }
}

/// Abstract embedding index.
///
/// All operations are async (via `async-trait`) so that networked or
/// file-backed stores fit the same interface. In-memory implementations
/// return immediately-ready futures.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](EmbeddingIndex::upsert) | Insert or overwrite records by key |
/// | [`replace_table`](EmbeddingIndex::replace_table) | Atomically swap all records of one table |
/// | [`delete_table`](EmbeddingIndex::delete_table) | Drop a table and its columns |
/// | [`clear`](EmbeddingIndex::clear) | Full wipe, including dimension and schema version |
/// | [`search`](EmbeddingIndex::search) | Threshold + top-K cosine search |
///
/// Writes of a single call are atomic: concurrent readers observe either
/// the state before the call or after it, never a mix.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Insert or overwrite records by `(kind, table, column)`.
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<()>;

    /// Delete every record of `table` and insert `records` in one step.
    async fn replace_table(&self, table: &str, records: Vec<EmbeddingRecord>) -> Result<()>;

    /// Remove the table record and all its column records. Returns the count removed.
    async fn delete_table(&self, table: &str) -> Result<usize>;

    /// Remove everything, including the stored dimension and schema version.
    async fn clear(&self) -> Result<()>;

    /// Cosine similarity search. Empty when nothing qualifies.
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<ScoredRecord>>;

    /// Dimension of the stored vectors, if any were ever written.
    async fn dims(&self) -> Result<Option<usize>>;

    /// Distinct table names that have at least one record.
    async fn tables(&self) -> Result<BTreeSet<String>>;

    /// Number of records of the given kind.
    async fn count(&self, kind: ElementKind) -> Result<usize>;

    /// Fetch one record by key.
    async fn record(
        &self,
        kind: ElementKind,
        table: &str,
        column: Option<&str>,
    ) -> Result<Option<EmbeddingRecord>>;

    /// Version of the schema the index was last populated for.
    async fn schema_version(&self) -> Result<Option<String>>;

    async fn set_schema_version(&self, version: &str) -> Result<()>;
}
