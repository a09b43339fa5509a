//! Precompute and update embeddings for a schema.
//!
//! For every table, one text for the table and one per column are embedded
//! and written with [`EmbeddingIndex::replace_table`], so a table's records
//! are always swapped as a unit.
//!
//! # Batching
//!
//! Texts are packed into batches of at most `batch_size`. A table's texts
//! share one batch unless the table alone is larger than `batch_size`; its
//! batches are then collected before the table is written. Batches run
//! concurrently (bounded by `concurrency`), each with a per-attempt timeout
//! and exponential-backoff retries on retryable provider errors.
//!
//! A batch that still fails leaves its tables un-embedded. They are listed
//! in [`PrecomputeReport::failed`] and the run carries on; a later
//! `precompute` picks them up again.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use schema_linker_core::embedding::{check_dims, EmbeddingProvider};
use schema_linker_core::index::{EmbeddingIndex, EmbeddingRecord};
use schema_linker_core::schema::{SchemaGraph, TableNode};
use schema_linker_core::{LinkError, Result};

use crate::config::EmbeddingConfig;

/// Tuning for a precompute run.
#[derive(Debug, Clone, Copy)]
pub struct PrecomputeOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    /// Bound on a single provider call.
    pub timeout: Duration,
    /// First retry delay; doubles per attempt up to `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PrecomputeOptions {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

impl PrecomputeOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// A table that could not be embedded in this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Outcome of a precompute or update run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrecomputeReport {
    /// Tables whose records were (re)written.
    pub embedded: Vec<String>,
    /// Tables left alone because they already had records.
    pub skipped: Vec<String>,
    /// Tables removed because they are no longer in the schema.
    pub deleted: Vec<String>,
    pub records_written: usize,
    pub batches: usize,
    pub failed: Vec<TableFailure>,
}

/// A contiguous run of one table's texts inside a batch.
#[derive(Debug, Clone, Copy)]
struct Part {
    table: usize,
    offset: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct Batch {
    texts: Vec<String>,
    parts: Vec<Part>,
}

/// Per-table texts and collected vectors.
struct Work<'a> {
    table: &'a TableNode,
    texts: Vec<String>,
    vectors: Vec<Option<Vec<f32>>>,
    error: Option<String>,
}

impl<'a> Work<'a> {
    fn new(table: &'a TableNode) -> Self {
        let mut texts = Vec::with_capacity(table.columns.len() + 1);
        texts.push(table.embedding_text());
        texts.extend(table.columns.iter().map(|c| table.column_text(c)));
        let vectors = vec![None; texts.len()];
        Self {
            table,
            texts,
            vectors,
            error: None,
        }
    }

    fn into_records(self, model: &str) -> Option<Vec<EmbeddingRecord>> {
        let mut vectors = self.vectors.into_iter();
        let mut records = vec![EmbeddingRecord::for_table(self.table, vectors.next()??, model)];
        for column in &self.table.columns {
            records.push(EmbeddingRecord::for_column(
                self.table,
                column,
                vectors.next()??,
                model,
            ));
        }
        Some(records)
    }
}

fn pack_batches(work: &[Work<'_>], batch_size: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::default();

    for (table, w) in work.iter().enumerate() {
        let n = w.texts.len();
        if n > batch_size {
            if !current.texts.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            for (i, chunk) in w.texts.chunks(batch_size).enumerate() {
                batches.push(Batch {
                    texts: chunk.to_vec(),
                    parts: vec![Part {
                        table,
                        offset: i * batch_size,
                        len: chunk.len(),
                    }],
                });
            }
            continue;
        }
        if current.texts.len() + n > batch_size {
            batches.push(std::mem::take(&mut current));
        }
        current.parts.push(Part {
            table,
            offset: 0,
            len: n,
        });
        current.texts.extend(w.texts.iter().cloned());
    }

    if !current.texts.is_empty() {
        batches.push(current);
    }
    batches
}

/// Embed one batch with timeout and retry.
async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    options: &PrecomputeOptions,
) -> Result<Vec<Vec<f32>>> {
    let mut last_err = None;

    for attempt in 0..=options.max_retries {
        if attempt > 0 {
            tokio::time::sleep(options.backoff(attempt)).await;
        }

        match tokio::time::timeout(options.timeout, provider.embed_batch(texts)).await {
            Ok(Ok(vectors)) => {
                if vectors.len() != texts.len() {
                    return Err(LinkError::fatal_provider(format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }
                check_dims(provider.dims(), &vectors)?;
                return Ok(vectors);
            }
            Ok(Err(e)) if e.is_retryable() => {
                tracing::warn!(attempt, error = %e, "embedding batch failed, retrying");
                last_err = Some(e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(attempt, timeout = ?options.timeout, "embedding batch timed out");
                last_err = Some(LinkError::transient(format!(
                    "embedding request timed out after {:?}",
                    options.timeout
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| LinkError::transient("embedding failed after retries")))
}

/// Runs precompute and update against one schema, index and provider.
pub struct Precomputer {
    graph: Arc<SchemaGraph>,
    index: Arc<dyn EmbeddingIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    options: PrecomputeOptions,
}

impl Precomputer {
    pub fn new(
        graph: Arc<SchemaGraph>,
        index: Arc<dyn EmbeddingIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        options: PrecomputeOptions,
    ) -> Self {
        Self {
            graph,
            index,
            provider,
            options,
        }
    }

    /// Bring the index in line with the schema.
    ///
    /// Deletes records of tables no longer in the schema, then embeds every
    /// table that has no records (or every table when `force_recompute`).
    /// Records the schema version when done.
    pub async fn precompute(&self, force_recompute: bool) -> Result<PrecomputeReport> {
        self.check_provider_dims().await?;
        let mut report = PrecomputeReport::default();

        let mut indexed = self.index.tables().await?;
        let stale: Vec<String> = indexed
            .iter()
            .filter(|t| !self.graph.contains_table(t))
            .cloned()
            .collect();
        for table in stale {
            let removed = self.index.delete_table(&table).await?;
            tracing::info!(table = %table, removed, "deleted records of dropped table");
            indexed.remove(&table);
            report.deleted.push(table);
        }

        let mut todo = Vec::new();
        for table in self.graph.tables() {
            if force_recompute || !indexed.contains(&table.name) {
                todo.push(table);
            } else {
                report.skipped.push(table.name.clone());
            }
        }

        self.embed_tables(todo, &mut report).await?;
        self.index.set_schema_version(self.graph.version()).await?;

        tracing::info!(
            embedded = report.embedded.len(),
            skipped = report.skipped.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "precompute finished"
        );
        Ok(report)
    }

    /// Re-embed one table, or every table when `table` is `None`.
    ///
    /// # Errors
    ///
    /// [`LinkError::SchemaIntegrity`] when `table` is not in the schema.
    pub async fn update(&self, table: Option<&str>) -> Result<PrecomputeReport> {
        let Some(name) = table else {
            return self.precompute(true).await;
        };
        let node = self.graph.table(name).ok_or_else(|| {
            LinkError::SchemaIntegrity(format!("table '{name}' not found in schema"))
        })?;

        self.check_provider_dims().await?;
        let mut report = PrecomputeReport::default();
        self.embed_tables(vec![node], &mut report).await?;
        Ok(report)
    }

    async fn check_provider_dims(&self) -> Result<()> {
        let dims = self.provider.dims();
        if dims == 0 {
            return Err(LinkError::config(
                "embedding provider is disabled; set [embedding] provider in config",
            ));
        }
        match self.index.dims().await? {
            Some(stored) if stored != dims => Err(LinkError::DimensionMismatch {
                expected: stored,
                actual: dims,
            }),
            _ => Ok(()),
        }
    }

    async fn embed_tables(&self, tables: Vec<&TableNode>, report: &mut PrecomputeReport) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }

        let mut work: Vec<Work<'_>> = tables.into_iter().map(Work::new).collect();
        let batches = pack_batches(&work, self.options.batch_size);
        report.batches += batches.len();
        tracing::debug!(
            tables = work.len(),
            batches = batches.len(),
            "embedding schema elements"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut set = JoinSet::new();
        let mut parts_by_batch = Vec::with_capacity(batches.len());

        for (i, batch) in batches.into_iter().enumerate() {
            parts_by_batch.push(batch.parts);
            let provider = self.provider.clone();
            let semaphore = semaphore.clone();
            let options = self.options;
            let texts = batch.texts;
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => embed_with_retry(provider.as_ref(), &texts, &options).await,
                    Err(e) => Err(LinkError::fatal_provider(e.to_string())),
                };
                (i, result)
            });
        }

        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            let (i, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    fatal = Some(LinkError::fatal_provider(format!("embedding task failed: {e}")));
                    continue;
                }
            };
            match result {
                Ok(vectors) => {
                    let mut vectors = vectors.into_iter();
                    for part in &parts_by_batch[i] {
                        let w = &mut work[part.table];
                        for slot in &mut w.vectors[part.offset..part.offset + part.len] {
                            *slot = vectors.next();
                        }
                    }
                }
                Err(e @ LinkError::DimensionMismatch { .. }) => fatal = Some(e),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding batch failed");
                    for part in &parts_by_batch[i] {
                        work[part.table].error = Some(e.to_string());
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let model = self.provider.model_name().to_string();
        for mut w in work {
            let name = w.table.name.clone();
            if let Some(error) = w.error.take() {
                report.failed.push(TableFailure { table: name, error });
                continue;
            }
            match w.into_records(&model) {
                Some(records) => {
                    let n = records.len();
                    self.index.replace_table(&name, records).await?;
                    report.records_written += n;
                    report.embedded.push(name);
                }
                None => report.failed.push(TableFailure {
                    table: name,
                    error: "missing vectors".to_string(),
                }),
            }
        }
        Ok(())
    }
}

/// Tables in the schema that have no records in the index.
pub async fn missing_tables(graph: &SchemaGraph, index: &dyn EmbeddingIndex) -> Result<BTreeSet<String>> {
    let indexed = index.tables().await?;
    Ok(graph
        .table_names()
        .filter(|t| !indexed.contains(*t))
        .map(str::to_string)
        .collect())
}
