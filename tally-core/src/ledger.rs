//! Ledger mutator
//!
//! Two single-account paths and one two-account transfer:
//!
//! - [`LedgerMutator::apply_unsafe`] reads without a lock, waits, and writes
//!   back unconditionally. Concurrent calls lose updates. It exists so the
//!   race harness can demonstrate the anomaly and must stay that way.
//! - [`LedgerMutator::apply_safe`] does the same read-modify-write under a
//!   row lock held for the whole transaction.
//! - [`LedgerMutator::transfer`] locks both rows in ascending key order,
//!   never in argument order, so opposite-direction transfers cannot wait on
//!   each other in a cycle.
//!
//! The read/write gap on both balance paths is configurable so tests can
//! widen or close the race window.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::{
    config::LedgerConfig,
    metrics::Metrics,
    store::{finish, Store, Transaction},
    types::{Account, AccountKey, BalanceResult, TransferResult, UpdateMethod},
    Error, Result,
};

/// Lock acquisition order for a set of accounts: ascending by key,
/// duplicates removed
pub fn lock_order(keys: &[AccountKey]) -> Vec<AccountKey> {
    let mut ordered = keys.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

/// Applies balance deltas and transfers
#[derive(Debug)]
pub struct LedgerMutator<S: Store> {
    store: S,
    race_delay: Duration,
    metrics: Option<Metrics>,
}

impl<S: Store> LedgerMutator<S> {
    /// Create mutator over a store
    pub fn new(store: S, config: &LedgerConfig) -> Self {
        Self {
            store,
            race_delay: config.race_delay(),
            metrics: None,
        }
    }

    /// Override the read/write gap
    pub fn with_race_delay(mut self, delay: Duration) -> Self {
        self.race_delay = delay;
        self
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

    /// Current committed balance, read without a lock
    pub async fn balance(&self, account: AccountKey) -> Result<Account> {
        self.store
            .account(account)
            .await?
            .ok_or(Error::AccountNotFound(account))
    }

    /// Read, wait, write back. No lock, no version check.
    #[cfg(feature = "race-harness")]
    pub async fn apply_unsafe(&self, account: AccountKey, delta: Decimal) -> Result<BalanceResult> {
        let started = Instant::now();
        let method = UpdateMethod::WithoutTransaction;

        let result = async {
            let previous = self.balance(account).await?.balance;
            self.pause().await;
            let new_balance = add(previous, delta)?;
            self.store
                .write_balance(account, new_balance)
                .await?
                .ok_or(Error::AccountNotFound(account))?;

            Ok(BalanceResult {
                account,
                previous_balance: previous,
                delta,
                new_balance,
                method,
            })
        }
        .await;

        self.observe_balance_update(method, started, &result);
        result
    }

    /// Row-locked read-modify-write in one transaction
    pub async fn apply_safe(&self, account: AccountKey, delta: Decimal) -> Result<BalanceResult> {
        let started = Instant::now();
        let method = UpdateMethod::WithTransaction;

        let result = match self.store.begin().await {
            Ok(mut tx) => {
                let applied = self.apply_locked(&mut tx, account, delta).await;
                finish(tx, applied).await
            }
            Err(err) => Err(err),
        };

        self.observe_balance_update(method, started, &result);
        result
    }

    async fn apply_locked(
        &self,
        tx: &mut S::Tx,
        account: AccountKey,
        delta: Decimal,
    ) -> Result<BalanceResult> {
        let previous = tx
            .lock_account(account)
            .await?
            .ok_or(Error::AccountNotFound(account))?
            .balance;

        self.pause().await;

        let new_balance = add(previous, delta)?;
        tx.update_balance(account, new_balance).await?;

        Ok(BalanceResult {
            account,
            previous_balance: previous,
            delta,
            new_balance,
            method: UpdateMethod::WithTransaction,
        })
    }

    /// Move `amount` from one account to another atomically
    pub async fn transfer(
        &self,
        from: AccountKey,
        to: AccountKey,
        amount: Decimal,
    ) -> Result<TransferResult> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidArgument(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if from == to {
            return Err(Error::InvalidArgument(format!(
                "cannot transfer from account {} to itself",
                from
            )));
        }

        let started = Instant::now();
        let result = match self.store.begin().await {
            Ok(mut tx) => {
                let moved = self.transfer_locked(&mut tx, from, to, amount).await;
                finish(tx, moved).await
            }
            Err(err) => Err(err),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_duration("transfer", started.elapsed().as_secs_f64());
            let outcome = match &result {
                Ok(_) => "completed",
                Err(Error::InsufficientBalance { .. }) => "insufficient_balance",
                Err(_) => "failed",
            };
            metrics.record_transfer(outcome);
            if let Err(err) = &result {
                metrics.record_error(err);
            }
        }

        if let Ok(transfer) = &result {
            info!(
                from = %transfer.from,
                to = %transfer.to,
                amount = %transfer.amount,
                "transfer committed"
            );
        }
        result
    }

    async fn transfer_locked(
        &self,
        tx: &mut S::Tx,
        from: AccountKey,
        to: AccountKey,
        amount: Decimal,
    ) -> Result<TransferResult> {
        let mut locked = BTreeMap::new();
        for key in lock_order(&[from, to]) {
            let account = tx
                .lock_account(key)
                .await?
                .ok_or(Error::AccountNotFound(key))?;
            locked.insert(key, account.balance);
        }
        debug!(%from, %to, "transfer rows locked");

        let from_balance = locked[&from];
        let to_balance = locked[&to];

        if from_balance < amount {
            return Err(Error::InsufficientBalance {
                required: amount,
                available: from_balance,
            });
        }

        let from_new = from_balance - amount;
        let to_new = add(to_balance, amount)?;
        tx.update_balance(from, from_new).await?;
        tx.update_balance(to, to_new).await?;

        Ok(TransferResult {
            from,
            to,
            amount,
            from_previous_balance: from_balance,
            from_new_balance: from_new,
            to_previous_balance: to_balance,
            to_new_balance: to_new,
        })
    }

    async fn pause(&self) {
        if !self.race_delay.is_zero() {
            tokio::time::sleep(self.race_delay).await;
        }
    }

    fn observe_balance_update(
        &self,
        method: UpdateMethod,
        started: Instant,
        result: &Result<BalanceResult>,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.record_duration(method.as_str(), started.elapsed().as_secs_f64());
        match result {
            Ok(_) => metrics.record_balance_update(method.as_str()),
            Err(err) => metrics.record_error(err),
        }
    }
}

fn add(balance: Decimal, delta: Decimal) -> Result<Decimal> {
    balance
        .checked_add(delta)
        .ok_or_else(|| Error::InvalidArgument(format!("{} + {} overflows", balance, delta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn key(id: i64) -> AccountKey {
        AccountKey::new(id)
    }

    fn mutator(store: &MemoryStore) -> LedgerMutator<MemoryStore> {
        LedgerMutator::new(store.clone(), &LedgerConfig::default()).with_race_delay(Duration::ZERO)
    }

    #[test]
    fn test_lock_order_ignores_argument_order() {
        assert_eq!(lock_order(&[key(9), key(2)]), vec![key(2), key(9)]);
        assert_eq!(lock_order(&[key(2), key(9)]), vec![key(2), key(9)]);
        assert_eq!(lock_order(&[key(5), key(1), key(5), key(3)]), vec![key(1), key(3), key(5)]);
    }

    #[tokio::test]
    async fn test_apply_safe_single_call() {
        let store = MemoryStore::new();
        store.open_account(key(1), dec!(10.50));

        let result = mutator(&store).apply_safe(key(1), dec!(-0.25)).await.unwrap();
        assert_eq!(result.previous_balance, dec!(10.50));
        assert_eq!(result.new_balance, dec!(10.25));
        assert_eq!(result.method, UpdateMethod::WithTransaction);
        assert_eq!(store.account(key(1)).await.unwrap().unwrap().balance, dec!(10.25));
    }

    #[cfg(feature = "race-harness")]
    #[tokio::test]
    async fn test_apply_unsafe_single_call() {
        let store = MemoryStore::new();
        store.open_account(key(1), dec!(100));

        let result = mutator(&store).apply_unsafe(key(1), dec!(0.1)).await.unwrap();
        assert_eq!(result.new_balance, dec!(100.1));
        assert_eq!(result.method, UpdateMethod::WithoutTransaction);
    }

    #[tokio::test]
    async fn test_missing_account() {
        let store = MemoryStore::new();
        let ledger = mutator(&store);

        assert!(matches!(
            ledger.apply_safe(key(404), dec!(1)).await,
            Err(Error::AccountNotFound(k)) if k == key(404)
        ));
        #[cfg(feature = "race-harness")]
        assert!(matches!(
            ledger.apply_unsafe(key(404), dec!(1)).await,
            Err(Error::AccountNotFound(_))
        ));
        assert!(matches!(ledger.balance(key(404)).await, Err(Error::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let store = MemoryStore::new();
        store.open_account(key(1), dec!(1000));
        store.open_account(key(2), dec!(200));

        let result = mutator(&store).transfer(key(1), key(2), dec!(500)).await.unwrap();
        assert_eq!(result.from_previous_balance, dec!(1000));
        assert_eq!(result.from_new_balance, dec!(500));
        assert_eq!(result.to_previous_balance, dec!(200));
        assert_eq!(result.to_new_balance, dec!(700));
    }

    #[tokio::test]
    async fn test_transfer_validates_before_touching_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        let ledger = mutator(&store);

        for amount in [dec!(0), dec!(-5)] {
            assert!(matches!(
                ledger.transfer(key(1), key(2), amount).await,
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            ledger.transfer(key(1), key(1), dec!(5)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_to_missing_account_rolls_back() {
        let store = MemoryStore::new();
        store.open_account(key(1), dec!(100));

        let err = mutator(&store).transfer(key(1), key(2), dec!(10)).await.unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(k) if k == key(2)));
        assert_eq!(store.account(key(1)).await.unwrap().unwrap().balance, dec!(100));
    }

    #[tokio::test]
    async fn test_transfer_metrics_by_outcome() {
        let store = MemoryStore::new();
        store.open_account(key(1), dec!(10));
        store.open_account(key(2), dec!(0));
        let metrics = Metrics::new().unwrap();
        let ledger = mutator(&store).with_metrics(metrics.clone());

        ledger.transfer(key(1), key(2), dec!(10)).await.unwrap();
        ledger.transfer(key(1), key(2), dec!(10)).await.unwrap_err();

        assert_eq!(metrics.transfers.with_label_values(&["completed"]).get(), 1);
        assert_eq!(
            metrics.transfers.with_label_values(&["insufficient_balance"]).get(),
            1
        );
    }
}
