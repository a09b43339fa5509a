//! # Schema Linker Core
//!
//! Runtime-agnostic logic for query-driven schema filtering: the schema
//! graph, embedding and index abstractions, foreign-key expansion,
//! reranking, and the filter orchestrator.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Concrete
//! embedding providers, the SQLite index and the precompute pipeline live
//! in the `schema-linker` app crate.

pub mod embedding;
pub mod error;
pub mod expand;
pub mod filter;
pub mod index;
pub mod rerank;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{LinkError, Result};
