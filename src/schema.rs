//! Loading the schema document named in `[schema] path`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use schema_linker_core::schema::SchemaGraph;

use crate::config::Config;

/// Read and validate the configured schema document.
pub fn load_schema(config: &Config) -> Result<Arc<SchemaGraph>> {
    load_schema_path(&config.schema.path)
}

/// Read and validate the M-Schema document at `path`.
pub fn load_schema_path(path: &Path) -> Result<Arc<SchemaGraph>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    let graph = SchemaGraph::from_json_str(&json)
        .with_context(|| format!("Invalid schema document: {}", path.display()))?;
    tracing::debug!(
        tables = graph.table_count(),
        columns = graph.column_count(),
        version = %graph.version(),
        "loaded schema"
    );
    Ok(Arc::new(graph))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_schema_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("schema.json");
        std::fs::write(
            &path,
            r#"{
                "db_id": "shop",
                "schema": "main",
                "tables": {
                    "orders": {
                        "table_description": "Orders",
                        "fields": { "id": { "type": "INTEGER", "primary_key": true } }
                    }
                },
                "foreign_keys": []
            }"#,
        )
        .unwrap();

        let graph = load_schema_path(&path).unwrap();
        assert_eq!(graph.db_id(), "shop");
        assert!(graph.contains_table("orders"));
    }

    #[test]
    fn test_missing_and_broken_files() {
        let tmp = TempDir::new().unwrap();
        let err = load_schema_path(&tmp.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read schema file"));

        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_schema_path(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid schema document"));
    }
}
