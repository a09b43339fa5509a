//! In-memory [`EmbeddingIndex`] implementation for tests and embedding.
//!
//! All state sits behind a single `std::sync::RwLock`, so every write call
//! is atomic with respect to readers. Search is brute-force cosine
//! similarity over the stored vectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{LinkError, Result};

use super::{
    check_batch_dims, check_table_ownership, rank, ElementKind, EmbeddingIndex, EmbeddingRecord,
    RecordKey, ScoredRecord, SearchQuery,
};

#[derive(Default)]
struct State {
    dims: Option<usize>,
    schema_version: Option<String>,
    records: BTreeMap<RecordKey, EmbeddingRecord>,
}

impl State {
    fn remove_table(&mut self, table: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|key, _| key.table != table);
        before - self.records.len()
    }

    fn insert_all(&mut self, records: Vec<EmbeddingRecord>) {
        for record in records {
            self.records.insert(record.key(), record);
        }
    }
}

/// In-memory embedding index.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| LinkError::Storage("in-memory index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| LinkError::Storage("in-memory index lock poisoned".into()))
    }
}

#[async_trait]
impl EmbeddingIndex for InMemoryIndex {
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        let mut state = self.write()?;
        if let Some(dims) = check_batch_dims(&records, state.dims)? {
            state.dims = Some(dims);
        }
        state.insert_all(records);
        Ok(())
    }

    async fn replace_table(&self, table: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
        check_table_ownership(table, &records)?;
        let mut state = self.write()?;
        let dims = check_batch_dims(&records, state.dims)?;
        state.remove_table(table);
        if dims.is_some() {
            state.dims = dims;
        }
        state.insert_all(records);
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<usize> {
        Ok(self.write()?.remove_table(table))
    }

    async fn clear(&self) -> Result<()> {
        *self.write()? = State::default();
        Ok(())
    }

    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<ScoredRecord>> {
        query.validate()?;
        let state = self.read()?;
        let Some(dims) = state.dims else {
            return Ok(Vec::new());
        };
        if query.vector.len() != dims {
            return Err(LinkError::DimensionMismatch {
                expected: dims,
                actual: query.vector.len(),
            });
        }

        let candidates = state
            .records
            .values()
            .filter(|record| query.admits(record))
            .map(|record| ScoredRecord {
                similarity: cosine_similarity(query.vector, &record.vector),
                record: record.clone(),
            })
            .collect();

        Ok(rank(candidates, query))
    }

    async fn dims(&self) -> Result<Option<usize>> {
        Ok(self.read()?.dims)
    }

    async fn tables(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .read()?
            .records
            .keys()
            .map(|key| key.table.clone())
            .collect())
    }

    async fn count(&self, kind: ElementKind) -> Result<usize> {
        Ok(self
            .read()?
            .records
            .keys()
            .filter(|key| key.kind == kind)
            .count())
    }

    async fn record(
        &self,
        kind: ElementKind,
        table: &str,
        column: Option<&str>,
    ) -> Result<Option<EmbeddingRecord>> {
        let key = RecordKey {
            kind,
            table: table.to_string(),
            column: column.map(str::to_string),
        };
        Ok(self.read()?.records.get(&key).cloned())
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        Ok(self.read()?.schema_version.clone())
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        self.write()?.schema_version = Some(version.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn record(kind: ElementKind, table: &str, column: Option<&str>, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            kind,
            table: table.to_string(),
            column: column.map(str::to_string),
            text: format!("{table} {}", column.unwrap_or("")),
            vector,
            metadata: Map::new(),
            model: "test".to_string(),
            embedded_at: 0,
        }
    }

    fn table(name: &str, vector: Vec<f32>) -> EmbeddingRecord {
        record(ElementKind::Table, name, None, vector)
    }

    fn query(vector: &[f32], top_k: usize, threshold: f32) -> SearchQuery<'_> {
        SearchQuery {
            vector,
            kind: ElementKind::Table,
            top_k,
            threshold,
            table_scope: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_key() {
        let index = InMemoryIndex::new();
        index.upsert(vec![table("a", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(vec![table("a", vec![0.0, 1.0])]).await.unwrap();

        assert_eq!(index.count(ElementKind::Table).await.unwrap(), 1);
        let stored = index
            .record(ElementKind::Table, "a", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
        assert_eq!(index.dims().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_dimension_switch_is_rejected() {
        let index = InMemoryIndex::new();
        index.upsert(vec![table("a", vec![0.1; 384])]).await.unwrap();

        let err = index
            .upsert(vec![table("b", vec![0.1; 1024])])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LinkError::DimensionMismatch {
                expected: 384,
                actual: 1024
            }
        );
        // Nothing from the rejected batch was written.
        assert_eq!(index.count(ElementKind::Table).await.unwrap(), 1);

        index.clear().await.unwrap();
        assert_eq!(index.dims().await.unwrap(), None);
        index.upsert(vec![table("b", vec![0.1; 1024])]).await.unwrap();
        assert_eq!(index.dims().await.unwrap(), Some(1024));
    }

    #[tokio::test]
    async fn test_search_threshold_out_of_range() {
        let index = InMemoryIndex::new();
        index.upsert(vec![table("a", vec![1.0, 0.0])]).await.unwrap();
        let err = index.search(&query(&[1.0, 0.0], 5, 1.1)).await.unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_search_zero_threshold_returns_top_k() {
        let index = InMemoryIndex::new();
        let records: Vec<EmbeddingRecord> = (0..8)
            .map(|i| {
                let angle = i as f32 * 0.4;
                table(&format!("t{i}"), vec![angle.cos(), angle.sin()])
            })
            .collect();
        index.upsert(records).await.unwrap();

        let hits = index.search(&query(&[1.0, 0.0], 5, 0.0)).await.unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.record.table.as_str()).collect();
        assert_eq!(names, vec!["t0", "t1", "t2", "t3", "t4"]);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_search_empty_index_is_empty() {
        let index = InMemoryIndex::new();
        let hits = index.search(&query(&[1.0, 0.0], 5, 0.5)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_query_dimension_mismatch() {
        let index = InMemoryIndex::new();
        index.upsert(vec![table("a", vec![1.0, 0.0])]).await.unwrap();
        let err = index
            .search(&query(&[1.0, 0.0, 0.0], 5, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_search_filters_kind_and_scope() {
        let index = InMemoryIndex::new();
        index
            .upsert(vec![
                table("orders", vec![1.0, 0.0]),
                record(ElementKind::Column, "orders", Some("id"), vec![1.0, 0.0]),
                record(ElementKind::Column, "customers", Some("id"), vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let scope: BTreeSet<String> = ["orders".to_string()].into();
        let hits = index
            .search(&SearchQuery {
                vector: &[1.0, 0.0],
                kind: ElementKind::Column,
                top_k: 10,
                threshold: 0.5,
                table_scope: Some(&scope),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.table, "orders");
        assert_eq!(hits[0].record.column.as_deref(), Some("id"));
    }

    #[tokio::test]
    async fn test_replace_and_delete_table() {
        let index = InMemoryIndex::new();
        index
            .upsert(vec![
                table("orders", vec![1.0, 0.0]),
                record(ElementKind::Column, "orders", Some("id"), vec![1.0, 0.0]),
                record(ElementKind::Column, "orders", Some("total"), vec![0.0, 1.0]),
                table("customers", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        index
            .replace_table(
                "orders",
                vec![
                    table("orders", vec![0.5, 0.5]),
                    record(ElementKind::Column, "orders", Some("id"), vec![0.5, 0.5]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(index.count(ElementKind::Column).await.unwrap(), 1);
        assert!(index
            .record(ElementKind::Column, "orders", Some("total"))
            .await
            .unwrap()
            .is_none());

        let removed = index.delete_table("orders").await.unwrap();
        assert_eq!(removed, 2);
        let tables = index.tables().await.unwrap();
        assert_eq!(tables.into_iter().collect::<Vec<_>>(), vec!["customers"]);
    }

    #[tokio::test]
    async fn test_replace_table_rejects_foreign_records() {
        let index = InMemoryIndex::new();
        let err = index
            .replace_table("orders", vec![table("customers", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_schema_version_cleared_with_index() {
        let index = InMemoryIndex::new();
        assert_eq!(index.schema_version().await.unwrap(), None);
        index.set_schema_version("abc").await.unwrap();
        assert_eq!(index.schema_version().await.unwrap().as_deref(), Some("abc"));
        index.clear().await.unwrap();
        assert_eq!(index.schema_version().await.unwrap(), None);
    }
}
