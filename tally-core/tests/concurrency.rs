//! Concurrency scenarios against the in-process store
//!
//! Every test runs on a multi-threaded runtime and spawns real tasks, so
//! lock waits and commits interleave across worker threads.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    config::{LedgerConfig, SequenceConfig},
    AccountKey, Error, LedgerMutator, MemoryStore, SequenceAllocator, Store, Transaction,
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn ledger(store: &MemoryStore, delay: Duration) -> Arc<LedgerMutator<MemoryStore>> {
    Arc::new(LedgerMutator::new(store.clone(), &LedgerConfig::default()).with_race_delay(delay))
}

async fn balance(store: &MemoryStore, id: i64) -> Decimal {
    store
        .account(AccountKey::new(id))
        .await
        .unwrap()
        .unwrap()
        .balance
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_safe_increments_all_land() {
    let store = MemoryStore::with_lock_timeout(LOCK_TIMEOUT);
    store.open_account(AccountKey::new(1), dec!(1000));
    let ledger = ledger(&store, Duration::from_millis(20));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.apply_safe(AccountKey::new(1), dec!(100)).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&store, 1).await, dec!(1500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_scenario() {
    let store = MemoryStore::with_lock_timeout(LOCK_TIMEOUT);
    store.open_account(AccountKey::new(1), dec!(1000));
    store.open_account(AccountKey::new(2), dec!(200));
    let ledger = ledger(&store, Duration::ZERO);

    let result = ledger
        .transfer(AccountKey::new(1), AccountKey::new(2), dec!(500))
        .await
        .unwrap();

    assert_eq!(result.from_new_balance, dec!(500));
    assert_eq!(result.to_new_balance, dec!(700));
    assert_eq!(balance(&store, 1).await, dec!(500));
    assert_eq!(balance(&store, 2).await, dec!(700));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insufficient_balance_changes_nothing() {
    let store = MemoryStore::with_lock_timeout(LOCK_TIMEOUT);
    store.open_account(AccountKey::new(1), dec!(50));
    store.open_account(AccountKey::new(2), dec!(10));
    let ledger = ledger(&store, Duration::ZERO);

    let err = ledger
        .transfer(AccountKey::new(1), AccountKey::new(2), dec!(50.01))
        .await
        .unwrap_err();

    match err {
        Error::InsufficientBalance {
            required,
            available,
        } => {
            assert_eq!(required, dec!(50.01));
            assert_eq!(available, dec!(50));
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }
    assert_eq!(balance(&store, 1).await, dec!(50));
    assert_eq!(balance(&store, 2).await, dec!(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_never_deadlock() {
    let store = MemoryStore::with_lock_timeout(Duration::from_secs(2));
    store.open_account(AccountKey::new(7), dec!(1000));
    store.open_account(AccountKey::new(3), dec!(1000));
    let ledger = ledger(&store, Duration::ZERO);

    let mut handles = Vec::new();
    for round in 0..50 {
        let (from, to) = if round % 2 == 0 { (7, 3) } else { (3, 7) };
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .transfer(AccountKey::new(from), AccountKey::new(to), dec!(1.25))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // 25 each way
    assert_eq!(balance(&store, 7).await, dec!(1000));
    assert_eq!(balance(&store, 3).await, dec!(1000));
}

/// Holds the lower key, starts a transfer in the given direction, and
/// checks the higher key is still free while the transfer waits.
async fn assert_transfer_queues_on_lower_key(from: i64, to: i64) {
    let low = AccountKey::new(from.min(to));
    let high = AccountKey::new(from.max(to));
    let store = MemoryStore::with_lock_timeout(Duration::from_millis(500));
    store.open_account(low, dec!(100));
    store.open_account(high, dec!(100));
    let ledger = ledger(&store, Duration::ZERO);

    let mut holder = store.begin().await.unwrap();
    holder.lock_account(low).await.unwrap();

    let transfer = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .transfer(AccountKey::new(from), AccountKey::new(to), dec!(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!transfer.is_finished());

    let mut bystander = store.begin().await.unwrap();
    let locked = bystander.lock_account(high).await;
    assert!(
        matches!(locked, Ok(Some(_))),
        "transfer {} -> {} took account {} before {}: {:?}",
        from,
        to,
        high,
        low,
        locked
    );
    bystander.rollback().await.unwrap();
    holder.rollback().await.unwrap();

    let result = transfer.await.unwrap().unwrap();
    assert_eq!(result.from_new_balance, dec!(90));
    assert_eq!(result.to_new_balance, dec!(110));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_locks_lower_key_first_when_debiting_higher() {
    assert_transfer_queues_on_lower_key(7, 3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_locks_lower_key_first_when_debiting_lower() {
    assert_transfer_queues_on_lower_key(3, 7).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_reader_never_sees_half_a_transfer() {
    let store = MemoryStore::with_lock_timeout(LOCK_TIMEOUT);
    store.open_account(AccountKey::new(1), dec!(1000));
    store.open_account(AccountKey::new(2), dec!(200));
    let ledger = ledger(&store, Duration::ZERO);

    let writers: Vec<_> = (0..20)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let (from, to) = if i % 3 == 0 { (2, 1) } else { (1, 2) };
                ledger
                    .transfer(AccountKey::new(from), AccountKey::new(to), dec!(10))
                    .await
            })
        })
        .collect();

    let reader_store = store.clone();
    let reader = tokio::spawn(async move {
        let mut sums = Vec::new();
        for _ in 0..20 {
            let mut tx = reader_store.begin().await.unwrap();
            let a = tx.lock_account(AccountKey::new(1)).await.unwrap().unwrap();
            let b = tx.lock_account(AccountKey::new(2)).await.unwrap().unwrap();
            sums.push(a.balance + b.balance);
            tx.rollback().await.unwrap();
            tokio::task::yield_now().await;
        }
        sums
    });

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    for sum in reader.await.unwrap() {
        assert_eq!(sum, dec!(1200));
    }
    assert_eq!(balance(&store, 1).await + balance(&store, 2).await, dec!(1200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_row_lock_surfaces_contention() {
    let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
    store.open_account(AccountKey::new(1), dec!(100));
    let ledger = ledger(&store, Duration::ZERO);

    let mut holder = store.begin().await.unwrap();
    holder.lock_account(AccountKey::new(1)).await.unwrap();

    let err = ledger
        .apply_safe(AccountKey::new(1), dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Contention(_)));
    assert!(err.is_retryable());
    assert_eq!(err.error_type(), "contention");

    holder.rollback().await.unwrap();
    ledger.apply_safe(AccountKey::new(1), dec!(1)).await.unwrap();
    assert_eq!(balance(&store, 1).await, dec!(101));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_concurrent_allocations_are_one_to_twenty() {
    let store = MemoryStore::with_lock_timeout(LOCK_TIMEOUT);
    let allocator = Arc::new(SequenceAllocator::new(
        store.clone(),
        &SequenceConfig::default(),
    ));
    let now = chrono::Utc::now();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                allocator
                    .allocate_at(serde_json::json!({ "index": i }), now)
                    .await
            })
        })
        .collect();

    let mut codes = HashSet::new();
    let mut sequences = Vec::new();
    for handle in handles {
        let document = handle.await.unwrap().unwrap();
        sequences.push(document.sequence);
        assert!(codes.insert(document.code));
    }

    sequences.sort_unstable();
    assert_eq!(sequences, (1..=20).collect::<Vec<u32>>());
    assert_eq!(store.document_count(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_collection_lock_surfaces_contention() {
    let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
    let allocator = SequenceAllocator::new(store.clone(), &SequenceConfig::default());

    let mut holder = store.begin().await.unwrap();
    holder.lock_documents().await.unwrap();

    let err = allocator
        .allocate(serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Contention(_)));
    assert_eq!(store.document_count(), 0);

    holder.commit().await.unwrap();
    let document = allocator.allocate(serde_json::json!({})).await.unwrap();
    assert_eq!(document.sequence, 1);
}
