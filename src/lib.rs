//! # Schema Linker
//!
//! Query-driven schema filtering for text-to-SQL. A relational schema is
//! embedded once (one vector per table and per column); each natural
//! language question is then answered with only the tables and columns that
//! are relevant to it, plus their foreign-key neighbours.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌──────────────┐   ┌──────────┐
//! │ M-Schema JSON │──▶│  Precompute  │──▶│  SQLite  │
//! │ tables + FKs  │   │ batch+embed  │   │ vectors  │
//! └───────────────┘   └──────────────┘   └────┬─────┘
//!                                             │
//!                                             ▼
//!        question ──▶ SchemaFilter: search → rerank → FK expand
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! slink init                          # create the index database
//! slink precompute                    # embed every table and column
//! slink filter "total sales per customer last month" --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`schema`] | Loading the schema document |
//! | [`embedding`] | Embedding providers (OpenAI, Ollama, hashing, local) |
//! | [`rerank`] | HTTP reranker and fallback wiring |
//! | [`sqlite_index`] | SQLite-backed embedding index |
//! | [`precompute`] | Batched, concurrent embedding of the schema |
//! | [`filter_cmd`] | `slink filter` |
//! | [`index_cmd`] | `slink precompute`, `update`, `clear` |
//! | [`stats`] | `slink stats` |
//! | [`db`] | Database connection |
//! | [`migrate`] | Index table migrations |
//! | [`logging`] | Tracing subscriber setup |
//!
//! Retrieval, reranking policy and FK expansion live in
//! [`schema_linker_core`], which has no I/O dependencies.

pub mod config;
pub mod db;
pub mod embedding;
pub mod filter_cmd;
pub mod index_cmd;
pub mod logging;
pub mod migrate;
pub mod precompute;
pub mod rerank;
pub mod schema;
pub mod sqlite_index;
pub mod stats;
