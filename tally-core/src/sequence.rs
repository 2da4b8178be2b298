//! Sequence allocator
//!
//! Hands out `PREFIX-YYYYMMDD-NNNNN` document codes that are unique and
//! strictly increasing in commit order within each UTC day.
//!
//! Allocation reads `MAX(sequence)` and inserts `MAX + 1` in one
//! transaction that holds an exclusive lock on the whole documents
//! collection. The aggregate read is what needs protecting, so a row lock
//! would not do: two writers could both read the same MAX before either
//! inserts.
//!
//! # Example
//!
//! ```no_run
//! use tally_core::{config::SequenceConfig, store::MemoryStore, SequenceAllocator};
//!
//! # async fn run() -> tally_core::Result<()> {
//! let allocator = SequenceAllocator::new(MemoryStore::new(), &SequenceConfig::default());
//! let document = allocator.allocate(serde_json::json!({ "customer": 42 })).await?;
//! assert!(document.code.starts_with("INV-"));
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::info;

use crate::{
    config::SequenceConfig,
    metrics::Metrics,
    store::{finish, Store, Transaction, MAX_PAGE_SIZE},
    types::{Document, DocumentCode, NewDocument, PartitionKey},
    Error, Result,
};

/// Default page size for [`SequenceAllocator::list`]
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Allocates sequential document codes
#[derive(Debug)]
pub struct SequenceAllocator<S: Store> {
    store: S,
    prefix: String,
    max_race_batch: usize,
    metrics: Option<Metrics>,
}

impl<S: Store> SequenceAllocator<S> {
    /// Create allocator over a store
    pub fn new(store: S, config: &SequenceConfig) -> Self {
        Self {
            store,
            prefix: config.prefix.clone(),
            max_race_batch: config.max_race_batch,
            metrics: None,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Upper bound on concurrent allocations the race harness may launch
    pub fn max_race_batch(&self) -> usize {
        self.max_race_batch
    }

    /// Allocate a document for today's partition
    pub async fn allocate(&self, payload: serde_json::Value) -> Result<Document> {
        self.allocate_at(payload, Utc::now()).await
    }

    /// Allocate a document for the UTC day containing `now`
    pub async fn allocate_at(
        &self,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Document> {
        let started = Instant::now();
        let partition = PartitionKey::for_instant(now);

        let result = match self.store.begin().await {
            Ok(mut tx) => {
                let allocated = self.allocate_in(&mut tx, &partition, payload, now).await;
                finish(tx, allocated).await
            }
            Err(err) => Err(err),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_duration("allocate", started.elapsed().as_secs_f64());
            match &result {
                Ok(_) => metrics.record_allocation(),
                Err(err) => metrics.record_error(err),
            }
        }

        if let Ok(document) = &result {
            info!(code = %document.code, sequence = document.sequence, "document allocated");
        }
        result
    }

    async fn allocate_in(
        &self,
        tx: &mut S::Tx,
        partition: &PartitionKey,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Document> {
        tx.lock_documents().await?;

        let last = tx.max_sequence(partition).await?;
        let next = last.checked_add(1).ok_or_else(|| {
            Error::SequenceConflict(format!("partition {} exhausted", partition))
        })?;

        let code = DocumentCode::new(self.prefix.as_str(), partition.clone(), next);
        let document = tx
            .insert_document(NewDocument {
                code,
                payload,
                created_at: now,
            })
            .await?;

        if document.sequence != next || document.partition != *partition {
            return Err(Error::SequenceConflict(format!(
                "{}: stored as {}/{}, expected {}/{}",
                document.code, document.partition, document.sequence, partition, next
            )));
        }

        Ok(document)
    }

    /// Look up a committed document by code
    pub async fn find(&self, code: &str) -> Result<Document> {
        DocumentCode::parse(code)?;
        self.store
            .document(code)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(code.to_string()))
    }

    /// Committed documents, newest first
    pub async fn list(&self, limit: Option<i64>, offset: Option<i64>) -> Result<Vec<Document>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        if limit <= 0 || offset < 0 {
            return Err(Error::InvalidArgument(format!(
                "limit must be positive and offset non-negative (limit={}, offset={})",
                limit, offset
            )));
        }
        self.store.documents(limit.min(MAX_PAGE_SIZE), offset).await
    }
}
