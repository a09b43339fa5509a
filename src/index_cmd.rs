//! `slink precompute`, `slink update` and `slink clear`.

use anyhow::{bail, Result};
use std::sync::Arc;

use schema_linker_core::index::EmbeddingIndex;

use crate::config::Config;
use crate::embedding;
use crate::precompute::{PrecomputeOptions, PrecomputeReport, Precomputer};
use crate::schema::load_schema;
use crate::sqlite_index::SqliteIndex;

async fn precomputer(config: &Config) -> Result<(Precomputer, Arc<SqliteIndex>)> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let graph = load_schema(config)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let index = Arc::new(SqliteIndex::open(config).await?);
    let runner = Precomputer::new(
        graph,
        index.clone(),
        provider,
        PrecomputeOptions::from_config(&config.embedding),
    );
    Ok((runner, index))
}

/// Embed every table that has no records yet (all of them with `force`).
pub async fn run_precompute(config: &Config, force: bool) -> Result<()> {
    let (runner, index) = precomputer(config).await?;
    let report = runner.precompute(force).await?;
    print_report("precompute", &report);
    index.close().await;
    finish(&report)
}

/// Re-embed one table, or all tables when `table` is `None`.
pub async fn run_update(config: &Config, table: Option<&str>) -> Result<()> {
    let (runner, index) = precomputer(config).await?;
    let report = runner.update(table).await?;
    print_report("update", &report);
    index.close().await;
    finish(&report)
}

/// Remove every record, the stored dimension and the schema version.
pub async fn run_clear(config: &Config) -> Result<()> {
    let index = SqliteIndex::open(config).await?;
    index.clear().await?;
    println!("index cleared: {}", config.db.path.display());
    index.close().await;
    Ok(())
}

fn print_report(label: &str, report: &PrecomputeReport) {
    println!("{label}");
    println!("  embedded tables: {}", report.embedded.len());
    println!("  skipped tables: {}", report.skipped.len());
    println!("  deleted tables: {}", report.deleted.len());
    println!("  records written: {}", report.records_written);
    println!("  batches: {}", report.batches);
    println!("  failed tables: {}", report.failed.len());
    for failure in &report.failed {
        println!("    {}: {}", failure.table, failure.error);
    }
}

fn finish(report: &PrecomputeReport) -> Result<()> {
    if report.failed.is_empty() {
        Ok(())
    } else {
        bail!(
            "{} table(s) could not be embedded; rerun precompute to retry them",
            report.failed.len()
        )
    }
}
