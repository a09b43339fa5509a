//! Query-driven schema filtering.
//!
//! [`SchemaFilter`] reduces a [`SchemaGraph`] to the tables and columns
//! relevant to one natural-language query:
//!
//! ```text
//! query ──► embed ──► table search ──► [rerank] ──► top-K tables
//!                                                      │
//!                         per table: column search ──► [rerank] ──► top-K columns
//!                                                      │
//!                                 FK expansion ◄───────┘
//!                                      │
//!                                      ▼
//!                               FilteredSchema
//! ```
//!
//! Filtering never writes to the index, so it is safe to run concurrently
//! with other filters and returns the same result for the same query while
//! the index is unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::embedding::{check_dims, EmbeddingProvider};
use crate::error::{LinkError, Result};
use crate::expand::ForeignKeyExpander;
use crate::index::{validate_threshold, ElementKind, EmbeddingIndex, ScoredRecord, SearchQuery};
use crate::rerank::{RerankCandidate, Reranker};
use crate::schema::{ColumnNode, ForeignKeyEdge, SchemaGraph, TableNode};

/// Retrieval parameters for one [`SchemaFilter::filter_schema`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub top_k_tables: usize,
    pub top_k_columns_per_table: usize,
    /// Minimum cosine similarity in `[0, 1]`; `0.0` disables the threshold.
    pub similarity_threshold: f32,
    /// Foreign-key hops to expand; `0` disables expansion.
    pub fk_hops: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            top_k_tables: 20,
            top_k_columns_per_table: 20,
            similarity_threshold: 0.6,
            fk_hops: 1,
        }
    }
}

impl FilterParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k_tables == 0 {
            return Err(LinkError::config("top_k_tables must be > 0"));
        }
        if self.top_k_columns_per_table == 0 {
            return Err(LinkError::config("top_k_columns_per_table must be > 0"));
        }
        validate_threshold(self.similarity_threshold)
    }
}

/// How the reranking stage sizes its input and output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankSettings {
    /// First-stage results fetched for the reranker to choose from.
    pub candidate_pool: usize,
    /// Tables kept by the reranker.
    pub top_k_tables: usize,
    /// Columns per table kept by the reranker.
    pub top_k_columns: usize,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            candidate_pool: 20,
            top_k_tables: 10,
            top_k_columns: 10,
        }
    }
}

/// Why a table is part of a [`FilteredSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum Inclusion {
    /// Selected by similarity search (and the reranker, when enabled).
    Retrieved {
        similarity: f32,
        rerank_score: Option<f32>,
    },
    /// Pulled in by foreign-key expansion at the given hop distance.
    Expanded { hops: usize },
}

/// A table in the filtered output with its selected columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredTable {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
    pub inclusion: Inclusion,
}

impl FilteredTable {
    fn from_node(table: &TableNode, columns: Vec<ColumnNode>, inclusion: Inclusion) -> Self {
        Self {
            name: table.name.clone(),
            description: table.description.clone(),
            columns,
            examples: table.examples.clone(),
            inclusion,
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// The subset of a schema relevant to one query.
///
/// Every column belongs to a listed table and every foreign key has both
/// endpoint tables listed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredSchema {
    pub db_id: String,
    pub schema: String,
    pub tables: Vec<FilteredTable>,
    pub foreign_keys: Vec<ForeignKeyEdge>,
}

impl FilteredSchema {
    fn empty(graph: &SchemaGraph) -> Self {
        Self {
            db_id: graph.db_id().to_string(),
            schema: graph.schema_name().to_string(),
            tables: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&FilteredTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.columns.len()).sum()
    }

    /// How much of `graph` this result keeps.
    pub fn compression(&self, graph: &SchemaGraph) -> CompressionStats {
        CompressionStats {
            tables_kept: self.tables.len(),
            tables_total: graph.table_count(),
            columns_kept: self.column_count(),
            columns_total: graph.column_count(),
        }
    }

    /// Render in the same M-Schema JSON shape the schema was loaded from.
    pub fn to_mschema(&self) -> Value {
        let mut tables = Map::new();
        for table in &self.tables {
            let mut fields = Map::new();
            for column in &table.columns {
                let mut field = Map::new();
                field.insert("type".into(), json!(column.data_type));
                field.insert("primary_key".into(), json!(column.primary_key));
                field.insert("column_description".into(), json!(column.description));
                if let Some(nullable) = column.nullable {
                    field.insert("nullable".into(), json!(nullable));
                }
                if !column.examples.is_empty() {
                    field.insert("examples".into(), json!(column.examples));
                }
                fields.insert(column.name.clone(), Value::Object(field));
            }
            tables.insert(
                table.name.clone(),
                json!({
                    "table_description": table.description,
                    "fields": fields,
                    "examples": table.examples,
                }),
            );
        }

        let foreign_keys: Vec<Value> = self
            .foreign_keys
            .iter()
            .map(|fk| {
                json!([
                    fk.table,
                    fk.column,
                    self.schema,
                    fk.referenced_table,
                    fk.referenced_column
                ])
            })
            .collect();

        json!({
            "db_id": self.db_id,
            "schema": self.schema,
            "tables": tables,
            "foreign_keys": foreign_keys,
        })
    }
}

/// Kept vs. total counts for a filtered schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    pub tables_kept: usize,
    pub tables_total: usize,
    pub columns_kept: usize,
    pub columns_total: usize,
}

impl CompressionStats {
    /// Fraction of tables kept, `0.0` for an empty schema.
    pub fn table_ratio(&self) -> f64 {
        ratio(self.tables_kept, self.tables_total)
    }

    pub fn column_ratio(&self) -> f64 {
        ratio(self.columns_kept, self.columns_total)
    }
}

fn ratio(kept: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        kept as f64 / total as f64
    }
}

/// One element surviving retrieval (and reranking).
#[derive(Debug, Clone)]
struct Selected {
    table: String,
    column: Option<String>,
    similarity: f32,
    rerank_score: Option<f32>,
}

impl Selected {
    fn from_scored(hit: ScoredRecord) -> Self {
        Self {
            table: hit.record.table,
            column: hit.record.column,
            similarity: hit.similarity,
            rerank_score: None,
        }
    }
}

/// Orchestrates retrieval, reranking and FK expansion over one schema.
pub struct SchemaFilter {
    graph: Arc<SchemaGraph>,
    index: Arc<dyn EmbeddingIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    expander: ForeignKeyExpander,
    reranker: Option<(Arc<dyn Reranker>, RerankSettings)>,
}

impl SchemaFilter {
    pub fn new(
        graph: Arc<SchemaGraph>,
        index: Arc<dyn EmbeddingIndex>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let expander = ForeignKeyExpander::new(&graph);
        Self {
            graph,
            index,
            provider,
            expander,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>, settings: RerankSettings) -> Self {
        self.reranker = Some((reranker, settings));
        self
    }

    pub fn graph(&self) -> &SchemaGraph {
        &self.graph
    }

    /// Fail unless the index was populated for this schema with this provider's dimension.
    pub async fn ensure_ready(&self) -> Result<()> {
        match self.index.schema_version().await? {
            Some(v) if v == self.graph.version() => {}
            Some(_) => {
                return Err(LinkError::NotInitialized(
                    "index was built for a different schema version; run precompute".into(),
                ))
            }
            None => {
                return Err(LinkError::NotInitialized(
                    "index is empty; run precompute".into(),
                ))
            }
        }
        if let Some(stored) = self.index.dims().await? {
            if stored != self.provider.dims() {
                return Err(LinkError::DimensionMismatch {
                    expected: stored,
                    actual: self.provider.dims(),
                });
            }
        }
        Ok(())
    }

    /// Select the tables and columns of the schema relevant to `user_query`.
    ///
    /// An empty result means nothing cleared the threshold; it is not an error.
    pub async fn filter_schema(&self, user_query: &str, params: &FilterParams) -> Result<FilteredSchema> {
        params.validate()?;
        self.ensure_ready().await?;

        let query_vector = self.provider.embed(user_query).await?;
        check_dims(self.provider.dims(), std::slice::from_ref(&query_vector))?;

        let tables = self.select_tables(user_query, &query_vector, params).await?;
        if tables.is_empty() {
            tracing::debug!("no table cleared the similarity threshold");
            return Ok(FilteredSchema::empty(&self.graph));
        }

        let mut columns: BTreeMap<String, Vec<Selected>> = BTreeMap::new();
        for table in &tables {
            let selected = self
                .select_columns(user_query, &query_vector, &table.table, params)
                .await?;
            columns.insert(table.table.clone(), selected);
        }

        let seeds: BTreeSet<String> = tables.iter().map(|t| t.table.clone()).collect();
        let distances = self.expander.hop_distances(&seeds, params.fk_hops);
        tracing::debug!(
            retrieved = seeds.len(),
            expanded = distances.len() - seeds.len(),
            hops = params.fk_hops,
            "schema filter selection"
        );

        Ok(self.assemble(&tables, &columns, &distances))
    }

    async fn select_tables(
        &self,
        user_query: &str,
        vector: &[f32],
        params: &FilterParams,
    ) -> Result<Vec<Selected>> {
        let pool = self.pool_size(params.top_k_tables);
        let hits = self
            .index
            .search(&SearchQuery {
                vector,
                kind: ElementKind::Table,
                top_k: pool,
                threshold: params.similarity_threshold,
                table_scope: None,
            })
            .await?;

        let mut selected = self
            .rerank(user_query, hits, |s| s.top_k_tables)
            .await?;
        selected.truncate(params.top_k_tables);
        Ok(selected)
    }

    async fn select_columns(
        &self,
        user_query: &str,
        vector: &[f32],
        table: &str,
        params: &FilterParams,
    ) -> Result<Vec<Selected>> {
        let scope = BTreeSet::from([table.to_string()]);
        let pool = self.pool_size(params.top_k_columns_per_table);
        let hits = self
            .index
            .search(&SearchQuery {
                vector,
                kind: ElementKind::Column,
                top_k: pool,
                threshold: params.similarity_threshold,
                table_scope: Some(&scope),
            })
            .await?;

        let mut selected = self
            .rerank(user_query, hits, |s| s.top_k_columns)
            .await?;
        selected.truncate(params.top_k_columns_per_table);
        Ok(selected)
    }

    fn pool_size(&self, top_k: usize) -> usize {
        match &self.reranker {
            Some((_, settings)) => top_k.max(settings.candidate_pool),
            None => top_k,
        }
    }

    async fn rerank(
        &self,
        user_query: &str,
        hits: Vec<ScoredRecord>,
        keep: impl Fn(&RerankSettings) -> usize,
    ) -> Result<Vec<Selected>> {
        let Some((reranker, settings)) = &self.reranker else {
            return Ok(hits.into_iter().map(Selected::from_scored).collect());
        };
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = hits
            .into_iter()
            .map(|hit| RerankCandidate {
                table: hit.record.table,
                column: hit.record.column,
                text: hit.record.text,
                similarity: hit.similarity,
            })
            .collect();
        let ranked = reranker
            .rerank(user_query, candidates, keep(settings).max(1))
            .await?;

        Ok(ranked
            .into_iter()
            .map(|r| Selected {
                table: r.candidate.table,
                column: r.candidate.column,
                similarity: r.candidate.similarity,
                rerank_score: Some(r.score),
            })
            .collect())
    }

    fn assemble(
        &self,
        tables: &[Selected],
        columns: &BTreeMap<String, Vec<Selected>>,
        distances: &BTreeMap<String, usize>,
    ) -> FilteredSchema {
        let mut out = FilteredSchema::empty(&self.graph);

        for selected in tables {
            let Some(node) = self.graph.table(&selected.table) else {
                continue;
            };
            let picked = columns.get(&selected.table).map(Vec::as_slice).unwrap_or(&[]);
            let cols: Vec<ColumnNode> = if picked.is_empty() {
                node.columns.clone()
            } else {
                picked
                    .iter()
                    .filter_map(|s| s.column.as_deref().and_then(|c| node.column(c)))
                    .cloned()
                    .collect()
            };
            out.tables.push(FilteredTable::from_node(
                node,
                cols,
                Inclusion::Retrieved {
                    similarity: selected.similarity,
                    rerank_score: selected.rerank_score,
                },
            ));
        }

        // Distances iterate in name order.
        for (name, hops) in distances {
            if *hops == 0 {
                continue;
            }
            if let Some(node) = self.graph.table(name) {
                out.tables.push(FilteredTable::from_node(
                    node,
                    node.columns.clone(),
                    Inclusion::Expanded { hops: *hops },
                ));
            }
        }

        let present: BTreeSet<String> = out.tables.iter().map(|t| t.name.clone()).collect();
        out.foreign_keys = self
            .graph
            .foreign_keys()
            .iter()
            .filter(|fk| fk.connects_within(&present))
            .cloned()
            .collect();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::InMemoryIndex;
    use crate::rerank::tests::FixedReranker;
    use crate::test_support::{populate, shop_graph, KeywordProvider};

    async fn shop_filter() -> (SchemaFilter, Arc<SchemaGraph>) {
        let graph = Arc::new(shop_graph());
        let index: Arc<dyn EmbeddingIndex> = Arc::new(InMemoryIndex::new());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(KeywordProvider::new());
        populate(&graph, index.as_ref(), provider.as_ref()).await;
        (SchemaFilter::new(graph.clone(), index, provider), graph)
    }

    fn params(top_k_tables: usize, threshold: f32, fk_hops: usize) -> FilterParams {
        FilterParams {
            top_k_tables,
            top_k_columns_per_table: 2,
            similarity_threshold: threshold,
            fk_hops,
        }
    }

    fn names(schema: &FilteredSchema) -> Vec<&str> {
        schema.table_names().collect()
    }

    fn assert_invariants(schema: &FilteredSchema, graph: &SchemaGraph) {
        let present: BTreeSet<String> = schema.table_names().map(str::to_string).collect();
        assert_eq!(present.len(), schema.tables.len(), "duplicate table");
        for table in &schema.tables {
            let node = graph.table(&table.name).expect("table exists in schema");
            for column in &table.columns {
                assert!(node.column(&column.name).is_some());
            }
        }
        for fk in &schema.foreign_keys {
            assert!(present.contains(&fk.table));
            assert!(present.contains(&fk.referenced_table));
        }
    }

    #[tokio::test]
    async fn test_top_two_tables_without_expansion() {
        let (filter, graph) = shop_filter().await;
        let result = filter
            .filter_schema("total sales amount per customer", &params(2, 0.3, 0))
            .await
            .unwrap();

        assert_eq!(names(&result), vec!["orders", "customers"]);
        let orders = result.table("orders").unwrap();
        assert_eq!(orders.column_names().collect::<Vec<_>>(), vec!["amount", "customer_id"]);
        let customers = result.table("customers").unwrap();
        assert_eq!(customers.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert!(matches!(orders.inclusion, Inclusion::Retrieved { rerank_score: None, .. }));

        assert_eq!(
            result.foreign_keys,
            vec![ForeignKeyEdge::new("orders", "customer_id", "customers", "id")]
        );
        assert_invariants(&result, &graph);
    }

    #[tokio::test]
    async fn test_expansion_adds_joined_table() {
        let (filter, graph) = shop_filter().await;
        let result = filter
            .filter_schema("total sales amount per customer", &params(1, 0.3, 1))
            .await
            .unwrap();

        assert_eq!(names(&result), vec!["orders", "customers"]);
        let customers = result.table("customers").unwrap();
        assert_eq!(customers.inclusion, Inclusion::Expanded { hops: 1 });
        // Expanded tables carry every column.
        assert_eq!(customers.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(result.foreign_keys.len(), 1);
        assert_invariants(&result, &graph);

        let without = filter
            .filter_schema("total sales amount per customer", &params(1, 0.3, 0))
            .await
            .unwrap();
        assert_eq!(names(&without), vec!["orders"]);
        assert!(without.foreign_keys.is_empty());
    }

    #[tokio::test]
    async fn test_customers_and_orders_exclude_products() {
        let (filter, graph) = shop_filter().await;
        let result = filter
            .filter_schema("show customers and their orders", &params(2, 0.6, 1))
            .await
            .unwrap();

        assert_eq!(names(&result), vec!["orders", "customers"]);
        assert!(result.table("products").is_none());
        for table in &result.tables {
            assert!(matches!(table.inclusion, Inclusion::Retrieved { .. }));
        }
        assert!(result
            .table("orders")
            .unwrap()
            .column_names()
            .any(|c| c == "customer_id"));
        assert_eq!(
            result.foreign_keys,
            vec![ForeignKeyEdge::new("orders", "customer_id", "customers", "id")]
        );
        assert_invariants(&result, &graph);
    }

    #[tokio::test]
    async fn test_high_threshold_yields_empty_schema() {
        let (filter, _) = shop_filter().await;
        let result = filter
            .filter_schema("total sales amount per customer", &params(5, 0.99, 1))
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(result.foreign_keys.is_empty());
        assert_eq!(result.db_id, "shop");
    }

    #[tokio::test]
    async fn test_table_without_column_hits_keeps_all_columns() {
        let (filter, graph) = shop_filter().await;
        let result = filter
            .filter_schema("sale", &params(3, 0.45, 0))
            .await
            .unwrap();
        assert_eq!(names(&result), vec!["orders"]);
        let orders = result.table("orders").unwrap();
        assert_eq!(
            orders.column_names().collect::<Vec<_>>(),
            vec!["id", "customer_id", "amount"]
        );
        assert_invariants(&result, &graph);
    }

    #[tokio::test]
    async fn test_filter_is_idempotent() {
        let (filter, _) = shop_filter().await;
        let p = params(2, 0.3, 1);
        let first = filter.filter_schema("customer name", &p).await.unwrap();
        let second = filter.filter_schema("customer name", &p).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_params_are_rejected() {
        let (filter, _) = shop_filter().await;
        for bad in [params(0, 0.5, 1), params(2, 1.5, 1), params(2, -0.1, 1)] {
            let err = filter.filter_schema("orders", &bad).await.unwrap_err();
            assert!(matches!(err, LinkError::Configuration(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_unpopulated_index_is_not_initialized() {
        let graph = Arc::new(shop_graph());
        let filter = SchemaFilter::new(
            graph,
            Arc::new(InMemoryIndex::new()),
            Arc::new(KeywordProvider::new()),
        );
        let err = filter
            .filter_schema("orders", &FilterParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_stale_schema_version_is_not_initialized() {
        let graph = Arc::new(shop_graph());
        let index = Arc::new(InMemoryIndex::new());
        let provider = Arc::new(KeywordProvider::new());
        populate(&graph, index.as_ref(), provider.as_ref()).await;
        index.set_schema_version("something-else").await.unwrap();

        let filter = SchemaFilter::new(graph, index, provider);
        let err = filter
            .filter_schema("orders", &FilterParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_reranker_reorders_and_truncates() {
        let (filter, graph) = shop_filter().await;
        let reranker = Arc::new(FixedReranker {
            name: "fixed",
            scores: vec![("customers:", 9.0), ("orders:", 1.0)],
            fail: false,
        });
        let filter = filter.with_reranker(
            reranker,
            RerankSettings {
                candidate_pool: 5,
                top_k_tables: 10,
                top_k_columns: 10,
            },
        );

        let result = filter
            .filter_schema("total sales amount per customer", &params(2, 0.3, 0))
            .await
            .unwrap();
        assert_eq!(names(&result), vec!["customers", "orders"]);
        match result.table("customers").unwrap().inclusion {
            Inclusion::Retrieved { rerank_score, .. } => assert_eq!(rerank_score, Some(1.0)),
            other => panic!("unexpected inclusion {other:?}"),
        }

        // The caller's top-K still bounds the reranked list.
        let result = filter
            .filter_schema("total sales amount per customer", &params(1, 0.3, 0))
            .await
            .unwrap();
        assert_eq!(names(&result), vec!["customers"]);
        assert_invariants(&result, &graph);
    }

    #[tokio::test]
    async fn test_compression_and_mschema_output() {
        let (filter, graph) = shop_filter().await;
        let result = filter
            .filter_schema("total sales amount per customer", &params(2, 0.3, 0))
            .await
            .unwrap();

        let stats = result.compression(&graph);
        assert_eq!(stats.tables_kept, 2);
        assert_eq!(stats.tables_total, 3);
        assert_eq!(stats.columns_kept, 4);
        assert_eq!(stats.columns_total, 7);
        assert!((stats.table_ratio() - 2.0 / 3.0).abs() < 1e-9);

        let doc = result.to_mschema();
        assert_eq!(doc["db_id"], "shop");
        let orders = &doc["tables"]["orders"];
        assert_eq!(orders["fields"]["amount"]["type"], "DECIMAL");
        assert_eq!(
            doc["foreign_keys"][0],
            json!(["orders", "customer_id", "main", "customers", "id"])
        );

        // The output parses back as a schema document.
        let reparsed = SchemaGraph::from_json_str(&doc.to_string()).unwrap();
        assert_eq!(reparsed.table_count(), 2);
        assert_eq!(reparsed.foreign_keys().len(), 1);
    }
}
