//! Race harness
//!
//! Fires concurrent batches through the ledger and the allocator and
//! reports what the store ended up holding. The unsafe path is expected to
//! lose updates under concurrency; a mismatch there is the demonstrated
//! outcome and is reported, never raised.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::{
    ledger::LedgerMutator,
    sequence::SequenceAllocator,
    store::Store,
    types::{AccountKey, PartitionKey, UpdateMethod},
    Error, Result,
};

/// Allocations launched when the caller does not ask for a count
pub const DEFAULT_SEQUENCE_PROOF_COUNT: usize = 5;

/// Final state of one path of a race run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathOutcome {
    /// Path the deltas went through
    pub method: UpdateMethod,
    /// Balance read after every call finished
    pub final_balance: Decimal,
    /// `final_balance == expected`
    pub matches_expected: bool,
    /// `expected - final_balance`; positive means updates were lost
    pub difference: Decimal,
    /// Calls that returned an error
    pub failed_calls: usize,
}

/// Result of [`RaceHarness::prove_race_condition`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    /// Account under test
    pub account: AccountKey,
    /// Balance before either run; both runs start from it
    pub initial_balance: Decimal,
    /// Deltas applied by each run
    pub deltas: Vec<Decimal>,
    /// Sum of `deltas`
    pub total_delta: Decimal,
    /// `initial_balance + total_delta`
    pub expected_balance: Decimal,
    /// Unlocked read-modify-write run
    pub unsafe_path: PathOutcome,
    /// Row-locked run
    pub safe_path: PathOutcome,
}

/// One document committed during a sequence run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedDocument {
    /// Public document code
    pub code: String,
    /// Day the sequence belongs to
    pub partition: PartitionKey,
    /// Sequence within the partition
    pub sequence: u32,
}

/// Result of [`RaceHarness::prove_sequence_allocation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    /// Allocations launched
    pub requested: usize,
    /// Documents that committed
    pub documents: Vec<AllocatedDocument>,
    /// Allocations that returned an error
    pub failed_calls: usize,
}

impl SequenceReport {
    /// Committed sequence numbers, ascending
    pub fn sequences(&self) -> Vec<u32> {
        let mut sequences: Vec<u32> = self.documents.iter().map(|d| d.sequence).collect();
        sequences.sort_unstable();
        sequences
    }

    /// True when at least one document committed and, within each
    /// partition, the committed sequences form one gap-free,
    /// duplicate-free run
    pub fn is_contiguous(&self) -> bool {
        if self.documents.is_empty() {
            return false;
        }
        let mut by_partition: BTreeMap<&PartitionKey, Vec<u32>> = BTreeMap::new();
        for document in &self.documents {
            by_partition
                .entry(&document.partition)
                .or_default()
                .push(document.sequence);
        }
        by_partition.into_values().all(|mut sequences| {
            sequences.sort_unstable();
            sequences.windows(2).all(|pair| pair[1] == pair[0] + 1)
        })
    }
}

/// Drives concurrent batches through a ledger and an allocator
#[derive(Debug)]
pub struct RaceHarness<'a, S: Store> {
    ledger: &'a LedgerMutator<S>,
    allocator: &'a SequenceAllocator<S>,
}

impl<'a, S: Store> RaceHarness<'a, S> {
    /// Harness over a ledger and an allocator sharing one store
    pub fn new(ledger: &'a LedgerMutator<S>, allocator: &'a SequenceAllocator<S>) -> Self {
        Self { ledger, allocator }
    }

    /// Run `deltas` concurrently through the unsafe path, then again
    /// through the safe path, starting from the same balance both times.
    ///
    /// The account is left at its initial balance plus the safe run's
    /// effect.
    pub async fn prove_race_condition(
        &self,
        account: AccountKey,
        deltas: &[Decimal],
    ) -> Result<RaceReport> {
        if deltas.is_empty() {
            return Err(Error::InvalidArgument(
                "race run needs at least one delta".to_string(),
            ));
        }

        let initial_balance = self.ledger.balance(account).await?.balance;
        let total_delta = deltas
            .iter()
            .try_fold(Decimal::ZERO, |sum, delta| sum.checked_add(*delta))
            .ok_or_else(|| Error::InvalidArgument("sum of deltas overflows".to_string()))?;
        let expected_balance = initial_balance
            .checked_add(total_delta)
            .ok_or_else(|| Error::InvalidArgument("expected balance overflows".to_string()))?;

        info!(
            %account,
            calls = deltas.len(),
            %initial_balance,
            %expected_balance,
            "starting race run"
        );

        self.reset(account, initial_balance).await?;
        let results = join_all(
            deltas
                .iter()
                .map(|delta| self.ledger.apply_unsafe(account, *delta)),
        )
        .await;
        let unsafe_path = self
            .outcome(account, UpdateMethod::WithoutTransaction, expected_balance, failures(&results))
            .await?;

        self.reset(account, initial_balance).await?;
        let results = join_all(
            deltas
                .iter()
                .map(|delta| self.ledger.apply_safe(account, *delta)),
        )
        .await;
        let safe_path = self
            .outcome(account, UpdateMethod::WithTransaction, expected_balance, failures(&results))
            .await?;

        Ok(RaceReport {
            account,
            initial_balance,
            deltas: deltas.to_vec(),
            total_delta,
            expected_balance,
            unsafe_path,
            safe_path,
        })
    }

    /// Launch `count` concurrent allocations and collect what committed
    pub async fn prove_sequence_allocation(&self, count: usize) -> Result<SequenceReport> {
        self.prove_sequence_allocation_at(count, Utc::now()).await
    }

    /// [`prove_sequence_allocation`](Self::prove_sequence_allocation) with
    /// one clock reading shared by the whole batch
    pub async fn prove_sequence_allocation_at(
        &self,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<SequenceReport> {
        let max = self.allocator.max_race_batch();
        if count == 0 || count > max {
            return Err(Error::InvalidArgument(format!(
                "allocation count must be between 1 and {}, got {}",
                max, count
            )));
        }

        let timestamp = now.to_rfc3339();
        let results = join_all((1..=count).map(|index| {
            self.allocator.allocate_at(
                json!({
                    "test": true,
                    "index": index,
                    "timestamp": timestamp,
                }),
                now,
            )
        }))
        .await;

        let mut documents = Vec::with_capacity(count);
        let mut failed_calls = 0;
        for result in results {
            match result {
                Ok(document) => documents.push(AllocatedDocument {
                    code: document.code,
                    partition: document.partition,
                    sequence: document.sequence,
                }),
                Err(err) => {
                    warn!(error = %err, "allocation failed during sequence run");
                    failed_calls += 1;
                }
            }
        }

        let report = SequenceReport {
            requested: count,
            documents,
            failed_calls,
        };
        info!(
            requested = count,
            committed = report.documents.len(),
            contiguous = report.is_contiguous(),
            "sequence run finished"
        );
        Ok(report)
    }

    async fn reset(&self, account: AccountKey, balance: Decimal) -> Result<()> {
        self.ledger
            .store()
            .write_balance(account, balance)
            .await?
            .ok_or(Error::AccountNotFound(account))?;
        Ok(())
    }

    async fn outcome(
        &self,
        account: AccountKey,
        method: UpdateMethod,
        expected: Decimal,
        failed_calls: usize,
    ) -> Result<PathOutcome> {
        let final_balance = self.ledger.balance(account).await?.balance;
        let difference = expected - final_balance;
        let matches_expected = difference.is_zero();

        if !matches_expected {
            warn!(
                %account,
                method = method.as_str(),
                %expected,
                %final_balance,
                %difference,
                "balance diverged from expected"
            );
        }

        Ok(PathOutcome {
            method,
            final_balance,
            matches_expected,
            difference,
            failed_calls,
        })
    }
}

fn failures<T>(results: &[Result<T>]) -> usize {
    results
        .iter()
        .filter(|result| match result {
            Ok(_) => false,
            Err(err) => {
                warn!(error = %err, "call failed during race run");
                true
            }
        })
        .count()
}
