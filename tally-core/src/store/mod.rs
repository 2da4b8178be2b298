//! Transactional store seam
//!
//! The core never caches balances or sequence counters; every value that
//! feeds a write is read through a [`Transaction`] under the lock that
//! protects it. Two backends implement the seam:
//!
//! - [`PgStore`] - PostgreSQL via sqlx (`LOCK TABLE`, `SELECT ... FOR UPDATE`)
//! - [`MemoryStore`] - in-process, with the same lock and visibility rules
//!
//! A transaction owns one connection for its whole lifetime. Dropping a
//! transaction without committing rolls it back.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::{
    types::{Account, AccountKey, Document, NewDocument, PartitionKey},
    Result,
};

mod memory;
mod pg;

pub use memory::{MemoryStore, MemoryTransaction};
pub use pg::{PgStore, PgTransaction, SCHEMA};

/// Upper bound on a single page of documents
pub const MAX_PAGE_SIZE: i64 = 100;

/// A transactional relational store
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Transaction handle
    type Tx: Transaction;

    /// Open a transaction on a dedicated connection
    async fn begin(&self) -> Result<Self::Tx>;

    /// Autocommit read of one account, no lock taken
    async fn account(&self, key: AccountKey) -> Result<Option<Account>>;

    /// Autocommit unconditional balance write
    ///
    /// Only for paths that deliberately skip read-modify-write protection.
    #[cfg(feature = "race-harness")]
    async fn write_balance(&self, key: AccountKey, balance: Decimal) -> Result<Option<Account>>;

    /// Look up a committed document by its public code
    async fn document(&self, code: &str) -> Result<Option<Document>>;

    /// Committed documents, newest first
    async fn documents(&self, limit: i64, offset: i64) -> Result<Vec<Document>>;
}

/// One open store transaction
#[async_trait]
pub trait Transaction: Send {
    /// Collection-exclusive lock on documents, held until commit/rollback
    async fn lock_documents(&mut self) -> Result<()>;

    /// Highest sequence in the partition, 0 when empty
    async fn max_sequence(&mut self, partition: &PartitionKey) -> Result<u32>;

    /// Insert a document row
    async fn insert_document(&mut self, document: NewDocument) -> Result<Document>;

    /// Row-exclusive lock on an account, `None` if it does not exist
    async fn lock_account(&mut self, key: AccountKey) -> Result<Option<Account>>;

    /// Overwrite a balance and stamp `updated_at`
    async fn update_balance(&mut self, key: AccountKey, balance: Decimal) -> Result<Account>;

    /// Publish all writes and release every lock
    async fn commit(self) -> Result<()>;

    /// Discard all writes and release every lock
    async fn rollback(self) -> Result<()>;
}

/// Commit on success, roll back on failure.
///
/// The operation's error always wins over a rollback failure; the latter
/// is only logged.
pub(crate) async fn finish<T: Transaction, R>(tx: T, result: Result<R>) -> Result<R> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            match tx.rollback().await {
                Ok(()) => warn!(error = %err, kind = err.error_type(), "transaction rolled back"),
                Err(rollback_err) => {
                    error!(error = %err, %rollback_err, "rollback failed")
                }
            }
            Err(err)
        }
    }
}
