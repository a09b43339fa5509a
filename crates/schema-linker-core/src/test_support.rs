//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::index::{EmbeddingIndex, EmbeddingRecord};
use crate::schema::SchemaGraph;

const VOCAB: [&str; 8] = [
    "order",
    "customer",
    "product",
    "price",
    "name",
    "amount",
    "sale",
    "identifier",
];

/// Bag-of-keywords provider: one dimension per vocabulary word.
///
/// Tokens are lowercased, split on anything non-alphanumeric, and a
/// trailing plural `s` is dropped from words longer than three letters.
pub(crate) struct KeywordProvider;

impl KeywordProvider {
    pub(crate) fn new() -> Self {
        Self
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; VOCAB.len()];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let stem = match token.strip_suffix('s') {
                Some(s) if token.len() > 3 => s,
                _ => token,
            };
            if let Some(i) = VOCAB.iter().position(|w| *w == stem) {
                v[i] += 1.0;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordProvider {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        VOCAB.len()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub(crate) const SHOP_SCHEMA: &str = r#"{
    "db_id": "shop",
    "schema": "main",
    "tables": {
        "orders": {
            "table_description": "Sales with amount per customer",
            "fields": {
                "id": {"type": "INTEGER", "primary_key": true, "column_description": "Order identifier"},
                "customer_id": {"type": "INTEGER", "column_description": "Customer reference"},
                "amount": {"type": "DECIMAL", "column_description": "Sale amount"}
            }
        },
        "customers": {
            "table_description": "Customer names",
            "fields": {
                "id": {"type": "INTEGER", "primary_key": true, "column_description": "Customer identifier"},
                "name": {"type": "TEXT", "column_description": "Customer name"}
            }
        },
        "products": {
            "table_description": "Product catalog with price",
            "fields": {
                "id": {"type": "INTEGER", "primary_key": true, "column_description": "Product identifier"},
                "price": {"type": "DECIMAL", "column_description": "Product price"}
            }
        }
    },
    "foreign_keys": [
        ["orders", "customer_id", "main", "customers", "id"]
    ]
}"#;

pub(crate) fn shop_graph() -> SchemaGraph {
    SchemaGraph::from_json_str(SHOP_SCHEMA).unwrap()
}

/// Embed every table and column of `graph` into `index` and stamp the version.
pub(crate) async fn populate(
    graph: &SchemaGraph,
    index: &dyn EmbeddingIndex,
    provider: &dyn EmbeddingProvider,
) {
    for table in graph.tables() {
        let mut records = vec![EmbeddingRecord::for_table(
            table,
            provider.embed(&table.embedding_text()).await.unwrap(),
            provider.model_name(),
        )];
        for column in &table.columns {
            records.push(EmbeddingRecord::for_column(
                table,
                column,
                provider.embed(&table.column_text(column)).await.unwrap(),
                provider.model_name(),
            ));
        }
        index.replace_table(&table.name, records).await.unwrap();
    }
    index.set_schema_version(graph.version()).await.unwrap();
}

#[test]
fn test_keyword_provider_stems_plurals() {
    assert_eq!(
        KeywordProvider::vector("Orders, sales: order_id"),
        KeywordProvider::vector("order sale order")
    );
    assert_eq!(KeywordProvider::vector("is"), vec![0.0; VOCAB.len()]);
}
