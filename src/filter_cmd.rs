//! `slink filter`: print the part of the schema relevant to a question.

use anyhow::Result;
use std::sync::Arc;

use schema_linker_core::filter::{FilterParams, FilteredSchema, Inclusion, SchemaFilter};

use crate::config::Config;
use crate::embedding;
use crate::rerank::create_reranker;
use crate::schema::load_schema;
use crate::sqlite_index::SqliteIndex;

/// Command-line values that take precedence over `[filter]`.
#[derive(Debug, Default, Clone)]
pub struct FilterOverrides {
    pub top_k_tables: Option<usize>,
    pub top_k_columns: Option<usize>,
    pub threshold: Option<f32>,
    pub hops: Option<usize>,
    pub no_rerank: bool,
}

impl FilterOverrides {
    pub fn apply(&self, mut params: FilterParams) -> FilterParams {
        if let Some(k) = self.top_k_tables {
            params.top_k_tables = k;
        }
        if let Some(k) = self.top_k_columns {
            params.top_k_columns_per_table = k;
        }
        if let Some(t) = self.threshold {
            params.similarity_threshold = t;
        }
        if let Some(h) = self.hops {
            params.fk_hops = h;
        }
        params
    }
}

/// Wire the schema, SQLite index, embedding provider and optional reranker.
pub async fn build_filter(config: &Config, use_reranker: bool) -> Result<(SchemaFilter, Arc<SqliteIndex>)> {
    let graph = load_schema(config)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let index = Arc::new(SqliteIndex::open(config).await?);

    let mut filter = SchemaFilter::new(graph, index.clone(), provider);
    if use_reranker {
        if let Some(reranker) = create_reranker(&config.reranker)? {
            tracing::debug!(reranker = reranker.name(), "reranking enabled");
            filter = filter.with_reranker(reranker, config.reranker.settings());
        }
    }
    Ok((filter, index))
}

pub async fn run_filter(
    config: &Config,
    query: &str,
    overrides: &FilterOverrides,
    json: bool,
) -> Result<()> {
    let params = overrides.apply(config.filter.params());
    let (filter, index) = build_filter(config, !overrides.no_rerank).await?;

    let filtered = filter.filter_schema(query, &params).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&filtered.to_mschema())?);
    } else {
        print_filtered(&filter, query, &filtered);
    }

    index.close().await;
    Ok(())
}

fn print_filtered(filter: &SchemaFilter, query: &str, filtered: &FilteredSchema) {
    if filtered.is_empty() {
        println!("No relevant tables.");
        return;
    }

    let stats = filtered.compression(filter.graph());
    println!("filter: {:?}", query);
    println!(
        "  tables: {} / {} ({:.1}%)  columns: {} / {} ({:.1}%)",
        stats.tables_kept,
        stats.tables_total,
        stats.table_ratio() * 100.0,
        stats.columns_kept,
        stats.columns_total,
        stats.column_ratio() * 100.0
    );
    println!();

    for (i, table) in filtered.tables.iter().enumerate() {
        println!("{}. {}  [{}]", i + 1, table.name, describe(&table.inclusion));
        if !table.description.is_empty() {
            println!("    {}", table.description);
        }
        for column in &table.columns {
            let pk = if column.primary_key { " PK" } else { "" };
            println!("    - {} {}{}", column.name, column.data_type, pk);
        }
        println!();
    }

    if !filtered.foreign_keys.is_empty() {
        println!("foreign keys:");
        for fk in &filtered.foreign_keys {
            println!(
                "  {}.{} -> {}.{}",
                fk.table, fk.column, fk.referenced_table, fk.referenced_column
            );
        }
    }
}

fn describe(inclusion: &Inclusion) -> String {
    match inclusion {
        Inclusion::Retrieved {
            similarity,
            rerank_score: Some(score),
        } => format!("similarity {similarity:.3}, rerank {score:.3}"),
        Inclusion::Retrieved { similarity, .. } => format!("similarity {similarity:.3}"),
        Inclusion::Expanded { hops } => {
            format!("via foreign key, {} hop{}", hops, if *hops == 1 { "" } else { "s" })
        }
    }
}
