//! `slink stats`: schema and index health overview.
//!
//! Shows what the schema holds, what the index holds, and whether the two
//! agree: the stored schema version, tables still waiting for embeddings,
//! and the embedding model(s) that produced the stored vectors.

use anyhow::Result;
use sqlx::Row;

use schema_linker_core::index::{ElementKind, EmbeddingIndex};

use crate::config::Config;
use crate::precompute::missing_tables;
use crate::schema::load_schema;
use crate::sqlite_index::SqliteIndex;

/// Per-model record counts.
struct ModelStats {
    model: String,
    dims: i64,
    records: i64,
    last_embedded_ts: Option<i64>,
}

/// Run the stats command: read schema and index and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let graph = load_schema(config)?;
    let index = SqliteIndex::open(config).await?;

    let table_records = index.count(ElementKind::Table).await?;
    let column_records = index.count(ElementKind::Column).await?;
    let dims = index.dims().await?;
    let stored_version = index.schema_version().await?;
    let missing = missing_tables(&graph, &index).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Schema Linker: Index Stats");
    println!("==========================");
    println!();
    println!("  Schema:      {}", config.schema.path.display());
    println!("  Database:    {}", graph.db_id());
    println!("  Tables:      {}", graph.table_count());
    println!("  Columns:     {}", graph.column_count());
    println!("  FKs:         {}", graph.foreign_keys().len());
    println!("  Version:     {}", short_version(graph.version()));
    println!();
    println!("  Index:       {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Dimensions:  {}",
        dims.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Embedded:    {} / {} tables, {} / {} columns",
        table_records,
        graph.table_count(),
        column_records,
        graph.column_count()
    );
    let status = match stored_version.as_deref() {
        None => "not initialized (run precompute)".to_string(),
        Some(v) if v == graph.version() => "up to date".to_string(),
        Some(v) => format!("stale, built for {} (run precompute)", short_version(v)),
    };
    println!("  Status:      {}", status);

    if !missing.is_empty() {
        println!();
        println!("  Missing tables ({}):", missing.len());
        for table in &missing {
            println!("    {}", table);
        }
    }

    let model_rows = sqlx::query(
        r#"
        SELECT model, dims, COUNT(*) AS records, MAX(embedded_at) AS last_embedded
        FROM schema_records
        GROUP BY model, dims
        ORDER BY records DESC
        "#,
    )
    .fetch_all(index.pool())
    .await?;

    let models: Vec<ModelStats> = model_rows
        .iter()
        .map(|row| ModelStats {
            model: row.get("model"),
            dims: row.get("dims"),
            records: row.get("records"),
            last_embedded_ts: row.get("last_embedded"),
        })
        .collect();

    if !models.is_empty() {
        println!();
        println!("  By model:");
        println!(
            "  {:<32} {:>6} {:>8}   {}",
            "MODEL", "DIMS", "RECORDS", "LAST EMBEDDED"
        );
        println!("  {}", "-".repeat(72));
        for m in &models {
            let when = match m.last_embedded_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<32} {:>6} {:>8}   {}",
                m.model, m.dims, m.records, when
            );
        }
    }

    println!();

    index.close().await;
    Ok(())
}

fn short_version(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_version("abc"), "abc");
    }
}
