//! Tally Core
//!
//! Transactional concurrency control over a shared relational store.
//!
//! # Architecture
//!
//! - **Sequence Allocator**: `PREFIX-YYYYMMDD-NNNNN` codes under a
//!   collection-exclusive lock, restarting at 1 each UTC day
//! - **Ledger Mutator**: row-locked balance updates and two-account
//!   transfers locked in ascending key order
//! - **Race Harness**: concurrent batches that show the unlocked path losing
//!   updates and the locked path reconciling
//! - **Store seam**: PostgreSQL via sqlx, or an in-process store with the
//!   same locking rules
//!
//! # Invariants
//!
//! - No two committed documents share a (partition, sequence)
//! - Transfers conserve the sum of the two balances
//! - A failed transaction leaves no partial writes behind

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
#[cfg(feature = "race-harness")]
pub mod harness;
pub mod ledger;
pub mod metrics;
pub mod sequence;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
#[cfg(feature = "race-harness")]
pub use harness::{RaceHarness, RaceReport, SequenceReport};
pub use ledger::LedgerMutator;
pub use sequence::SequenceAllocator;
pub use store::{MemoryStore, PgStore, Store, Transaction};
pub use types::{
    Account, AccountKey, BalanceResult, Document, DocumentCode, PartitionKey, TransferResult,
    UpdateMethod,
};
