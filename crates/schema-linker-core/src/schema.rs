//! Schema graph: tables, columns and declared foreign keys.
//!
//! The input is an M-Schema style JSON document:
//!
//! ```json
//! {
//!   "db_id": "shop",
//!   "schema": "public",
//!   "tables": {
//!     "public.orders": {
//!       "table_description": "Orders placed by customers",
//!       "fields": {
//!         "id": { "type": "INTEGER", "primary_key": true, "column_description": "Order id" },
//!         "customer_id": { "type": "INTEGER", "comment": "Buyer" }
//!       }
//!     }
//!   },
//!   "foreign_keys": [
//!     ["public.orders", "customer_id", "public", "public.customers", "id"]
//!   ]
//! }
//! ```
//!
//! Foreign keys are accepted either in the positional M-Schema form
//! `[table, column, ref_schema, ref_table, ref_column]` (or the 4-element
//! form without `ref_schema`), or as objects with `table`, `column`,
//! `referenced_table` and `referenced_column` keys.
//!
//! A [`SchemaGraph`] is immutable once built. Its [`version`](SchemaGraph::version)
//! is a SHA-256 fingerprint of the tables and foreign keys, used by the
//! index to tell whether it was populated for this exact schema.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{LinkError, Result};

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnNode {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub description: String,
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

impl ColumnNode {
    pub fn new(name: &str, data_type: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            description: description.to_string(),
            primary_key: false,
            nullable: None,
            examples: Vec::new(),
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// A table with its ordered columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableNode {
    /// Schema-qualified name, unique within the document.
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

impl TableNode {
    pub fn new(name: &str, description: &str, columns: Vec<ColumnNode>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            columns,
            examples: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnNode> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Text embedded for the table itself: `"{name}: {description}"`.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }

    /// Text embedded for one of its columns:
    /// `"{table}.{column} ({type}): {description}"`.
    pub fn column_text(&self, column: &ColumnNode) -> String {
        format!(
            "{}.{} ({}): {}",
            self.name, column.name, column.data_type, column.description
        )
    }
}

/// `(table, column) → (referenced_table, referenced_column)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyEdge {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKeyEdge {
    pub fn new(table: &str, column: &str, referenced_table: &str, referenced_column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            referenced_table: referenced_table.to_string(),
            referenced_column: referenced_column.to_string(),
        }
    }

    /// True when both endpoint tables are in `tables`.
    pub fn connects_within(&self, tables: &BTreeSet<String>) -> bool {
        tables.contains(&self.table) && tables.contains(&self.referenced_table)
    }
}

// ============ Document format ============

/// Raw schema document as read from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub db_id: String,
    #[serde(default)]
    pub schema: String,
    /// Table name → table body. Field order inside each body is kept.
    #[serde(default)]
    pub tables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub foreign_keys: Vec<RawForeignKey>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TableBody {
    #[serde(default)]
    table_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
    #[serde(default)]
    examples: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FieldBody {
    #[serde(default, rename = "type")]
    data_type: String,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    nullable: Option<bool>,
    #[serde(default)]
    column_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    examples: Vec<Value>,
}

impl TableBody {
    fn description(&mut self) -> String {
        first_non_empty([
            self.table_description.take(),
            self.description.take(),
            self.comment.take(),
        ])
    }
}

impl FieldBody {
    fn description(self) -> String {
        first_non_empty([self.column_description, self.description, self.comment])
    }
}

/// The first present, non-blank description; later keys are fallbacks.
fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> String {
    candidates
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or_default()
}

/// A foreign key entry in either of the accepted document forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawForeignKey {
    /// `ref_schema` (third of five) may be `null` for same-schema keys.
    Positional(Vec<Option<String>>),
    Named {
        #[serde(alias = "source_table", alias = "from_table")]
        table: String,
        #[serde(alias = "source_column", alias = "from_column")]
        column: String,
        #[serde(alias = "target_table", alias = "to_table")]
        referenced_table: String,
        #[serde(alias = "target_column", alias = "to_column")]
        referenced_column: String,
    },
}

impl RawForeignKey {
    fn into_edge(self) -> Result<ForeignKeyEdge> {
        match self {
            RawForeignKey::Positional(parts) => match parts.as_slice() {
                [Some(t), Some(c), _, Some(rt), Some(rc)] | [Some(t), Some(c), Some(rt), Some(rc)] => {
                    Ok(ForeignKeyEdge::new(t, c, rt, rc))
                }
                [_, _, _, _, _] | [_, _, _, _] => Err(LinkError::SchemaIntegrity(format!(
                    "foreign key entry {parts:?} has a null table or column"
                ))),
                other => Err(LinkError::SchemaIntegrity(format!(
                    "foreign key entry must have 4 or 5 elements, got {}",
                    other.len()
                ))),
            },
            RawForeignKey::Named {
                table,
                column,
                referenced_table,
                referenced_column,
            } => Ok(ForeignKeyEdge {
                table,
                column,
                referenced_table,
                referenced_column,
            }),
        }
    }
}

// ============ Graph ============

/// In-memory graph of tables, columns and foreign keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaGraph {
    db_id: String,
    schema: String,
    tables: BTreeMap<String, TableNode>,
    foreign_keys: Vec<ForeignKeyEdge>,
    version: String,
}

impl SchemaGraph {
    /// Build a graph from tables and edges, validating referential integrity.
    ///
    /// # Errors
    ///
    /// [`LinkError::SchemaIntegrity`] on duplicate table or column names,
    /// or on a foreign key whose endpoint table or column is not defined.
    pub fn new(tables: Vec<TableNode>, foreign_keys: Vec<ForeignKeyEdge>) -> Result<Self> {
        Self::build(String::new(), String::new(), tables, foreign_keys)
    }

    /// Parse an M-Schema JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let doc: SchemaDocument = serde_json::from_str(json)
            .map_err(|e| LinkError::SchemaIntegrity(format!("invalid schema document: {e}")))?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: SchemaDocument) -> Result<Self> {
        let mut tables = Vec::with_capacity(doc.tables.len());
        for (name, body) in doc.tables {
            let mut body: TableBody = serde_json::from_value(body).map_err(|e| {
                LinkError::SchemaIntegrity(format!("invalid table '{name}': {e}"))
            })?;
            let mut columns = Vec::with_capacity(body.fields.len());
            for (col_name, field) in std::mem::take(&mut body.fields) {
                let field: FieldBody = serde_json::from_value(field).map_err(|e| {
                    LinkError::SchemaIntegrity(format!("invalid column '{name}.{col_name}': {e}"))
                })?;
                columns.push(ColumnNode {
                    name: col_name,
                    data_type: field.data_type.clone(),
                    primary_key: field.primary_key,
                    nullable: field.nullable,
                    examples: field.examples.clone(),
                    description: field.description(),
                });
            }
            tables.push(TableNode {
                name,
                description: body.description(),
                columns,
                examples: body.examples,
            });
        }

        let foreign_keys = doc
            .foreign_keys
            .into_iter()
            .map(RawForeignKey::into_edge)
            .collect::<Result<Vec<_>>>()?;

        Self::build(doc.db_id, doc.schema, tables, foreign_keys)
    }

    fn build(
        db_id: String,
        schema: String,
        tables: Vec<TableNode>,
        foreign_keys: Vec<ForeignKeyEdge>,
    ) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for table in tables {
            let mut seen = BTreeSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(LinkError::SchemaIntegrity(format!(
                        "duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
            }
            let name = table.name.clone();
            if by_name.insert(name.clone(), table).is_some() {
                return Err(LinkError::SchemaIntegrity(format!(
                    "duplicate table '{name}'"
                )));
            }
        }

        for fk in &foreign_keys {
            for (table, column) in [
                (&fk.table, &fk.column),
                (&fk.referenced_table, &fk.referenced_column),
            ] {
                let node: &TableNode = by_name.get(table).ok_or_else(|| {
                    LinkError::SchemaIntegrity(format!(
                        "foreign key {}.{} -> {}.{} references unknown table '{}'",
                        fk.table, fk.column, fk.referenced_table, fk.referenced_column, table
                    ))
                })?;
                if node.column(column).is_none() {
                    return Err(LinkError::SchemaIntegrity(format!(
                        "foreign key {}.{} -> {}.{} references unknown column '{}.{}'",
                        fk.table, fk.column, fk.referenced_table, fk.referenced_column, table, column
                    )));
                }
            }
        }

        let version = fingerprint(&by_name, &foreign_keys);

        Ok(Self {
            db_id,
            schema,
            tables: by_name,
            foreign_keys,
            version,
        })
    }

    pub fn db_id(&self) -> &str {
        &self.db_id
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    /// Hex SHA-256 fingerprint of the tables and foreign keys.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn table(&self, name: &str) -> Option<&TableNode> {
        self.tables.get(name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableNode> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyEdge] {
        &self.foreign_keys
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn column_count(&self) -> usize {
        self.tables.values().map(|t| t.columns.len()).sum()
    }
}

fn fingerprint(tables: &BTreeMap<String, TableNode>, foreign_keys: &[ForeignKeyEdge]) -> String {
    let mut hasher = Sha256::new();
    for table in tables.values() {
        // Struct serialization cannot fail; the fallback keeps the hash total.
        hasher.update(serde_json::to_vec(table).unwrap_or_default());
        hasher.update([0u8]);
    }
    for fk in foreign_keys {
        hasher.update(serde_json::to_vec(fk).unwrap_or_default());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
