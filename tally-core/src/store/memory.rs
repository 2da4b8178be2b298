//! In-process store with Postgres-like locking
//!
//! - Row locks are per-account async mutexes, held by the transaction until
//!   commit or rollback.
//! - The documents collection lock is a single async mutex.
//! - Transactional writes are buffered and published atomically at commit,
//!   so no reader ever observes an uncommitted balance.
//! - Lock waits are bounded by the configured timeout and fail with
//!   `Contention` when it elapses.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::{Store, Transaction};
use crate::{
    types::{Account, AccountKey, Document, NewDocument, PartitionKey},
    Error, Result,
};

#[derive(Debug)]
struct AccountSlot {
    row: Account,
    lock: Arc<AsyncMutex<()>>,
}

#[derive(Debug)]
struct Inner {
    accounts: RwLock<HashMap<AccountKey, AccountSlot>>,
    documents: RwLock<Vec<Document>>,
    documents_lock: Arc<AsyncMutex<()>>,
    next_document_id: AtomicI64,
    lock_timeout: Option<Duration>,
    available: AtomicBool,
}

impl Inner {
    fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            documents: RwLock::new(Vec::new()),
            documents_lock: Arc::new(AsyncMutex::new(())),
            next_document_id: AtomicI64::new(1),
            lock_timeout,
            available: AtomicBool::new(true),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store is offline".to_string()))
        }
    }

    fn committed_account(&self, key: AccountKey) -> Option<Account> {
        self.accounts.read().get(&key).map(|slot| slot.row.clone())
    }

    fn row_lock(&self, key: AccountKey) -> Option<Arc<AsyncMutex<()>>> {
        self.accounts.read().get(&key).map(|slot| slot.lock.clone())
    }

    async fn acquire(
        &self,
        lock: Arc<AsyncMutex<()>>,
        what: impl fmt::Display + Send,
    ) -> Result<OwnedMutexGuard<()>> {
        match self.lock_timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| {
                    Error::Contention(format!("lock wait on {} exceeded {:?}", what, limit))
                }),
            None => Ok(lock.lock_owned().await),
        }
    }
}

/// In-process transactional store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("accounts", &self.inner.accounts.read().len())
            .field("documents", &self.inner.documents.read().len())
            .field("lock_timeout", &self.inner.lock_timeout)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose lock waits never time out
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Store whose lock waits fail with `Contention` after `limit`
    pub fn with_lock_timeout(limit: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::new(Some(limit))),
        }
    }

    /// Create or reset an account
    pub fn open_account(&self, key: AccountKey, balance: Decimal) -> Account {
        let row = Account {
            key,
            balance,
            updated_at: Utc::now(),
        };
        let mut accounts = self.inner.accounts.write();
        match accounts.get_mut(&key) {
            Some(slot) => slot.row = row.clone(),
            None => {
                accounts.insert(
                    key,
                    AccountSlot {
                        row: row.clone(),
                        lock: Arc::new(AsyncMutex::new(())),
                    },
                );
            }
        }
        row
    }

    /// Take the store offline (or back online); every call fails with
    /// `StoreUnavailable` while offline
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Number of committed documents
    pub fn document_count(&self) -> usize {
        self.inner.documents.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        self.inner.ensure_available()?;
        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            documents_guard: None,
            row_guards: BTreeMap::new(),
            pending_documents: Vec::new(),
            pending_balances: BTreeMap::new(),
        })
    }

    async fn account(&self, key: AccountKey) -> Result<Option<Account>> {
        self.inner.ensure_available()?;
        Ok(self.inner.committed_account(key))
    }

    #[cfg(feature = "race-harness")]
    async fn write_balance(&self, key: AccountKey, balance: Decimal) -> Result<Option<Account>> {
        self.inner.ensure_available()?;
        let Some(lock) = self.inner.row_lock(key) else {
            return Ok(None);
        };

        // A plain UPDATE still queues behind a row held FOR UPDATE
        let _guard = self.inner.acquire(lock, format!("account {}", key)).await?;

        let mut accounts = self.inner.accounts.write();
        Ok(accounts.get_mut(&key).map(|slot| {
            slot.row.balance = balance;
            slot.row.updated_at = Utc::now();
            slot.row.clone()
        }))
    }

    async fn document(&self, code: &str) -> Result<Option<Document>> {
        self.inner.ensure_available()?;
        let documents = self.inner.documents.read();
        Ok(documents.iter().find(|doc| doc.code == code).cloned())
    }

    async fn documents(&self, limit: i64, offset: i64) -> Result<Vec<Document>> {
        self.inner.ensure_available()?;
        let mut page: Vec<Document> = self.inner.documents.read().clone();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(page.into_iter().skip(offset).take(limit).collect())
    }
}

/// Open memory transaction
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    documents_guard: Option<OwnedMutexGuard<()>>,
    row_guards: BTreeMap<AccountKey, OwnedMutexGuard<()>>,
    pending_documents: Vec<Document>,
    pending_balances: BTreeMap<AccountKey, Account>,
}

impl fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("documents_locked", &self.documents_guard.is_some())
            .field("locked_accounts", &self.row_guards.keys().collect::<Vec<_>>())
            .field("pending_documents", &self.pending_documents.len())
            .field("pending_balances", &self.pending_balances.len())
            .finish()
    }
}

impl MemoryTransaction {
    fn visible_account(&self, key: AccountKey) -> Option<Account> {
        self.pending_balances
            .get(&key)
            .cloned()
            .or_else(|| self.inner.committed_account(key))
    }

    fn slot_taken(&self, partition: &PartitionKey, sequence: u32, code: &str) -> bool {
        let clashes = |doc: &Document| {
            (doc.partition == *partition && doc.sequence == sequence) || doc.code == code
        };
        self.pending_documents.iter().any(clashes) || self.inner.documents.read().iter().any(clashes)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn lock_documents(&mut self) -> Result<()> {
        self.inner.ensure_available()?;
        if self.documents_guard.is_none() {
            let lock = self.inner.documents_lock.clone();
            let guard = self.inner.acquire(lock, "documents").await?;
            self.documents_guard = Some(guard);
            debug!("documents collection locked");
        }
        Ok(())
    }

    async fn max_sequence(&mut self, partition: &PartitionKey) -> Result<u32> {
        self.inner.ensure_available()?;
        let committed = self
            .inner
            .documents
            .read()
            .iter()
            .filter(|doc| doc.partition == *partition)
            .map(|doc| doc.sequence)
            .max()
            .unwrap_or(0);
        let pending = self
            .pending_documents
            .iter()
            .filter(|doc| doc.partition == *partition)
            .map(|doc| doc.sequence)
            .max()
            .unwrap_or(0);
        Ok(committed.max(pending))
    }

    async fn insert_document(&mut self, document: NewDocument) -> Result<Document> {
        self.inner.ensure_available()?;
        let code = document.code.to_string();
        let partition = document.code.partition().clone();
        let sequence = document.code.sequence();

        if self.slot_taken(&partition, sequence, &code) {
            return Err(Error::SequenceConflict(format!(
                "{}: partition {} already holds sequence {}",
                code, partition, sequence
            )));
        }

        let row = Document {
            id: self.inner.next_document_id.fetch_add(1, Ordering::Relaxed),
            code,
            partition,
            sequence,
            payload: document.payload,
            created_at: document.created_at,
        };
        self.pending_documents.push(row.clone());
        Ok(row)
    }

    async fn lock_account(&mut self, key: AccountKey) -> Result<Option<Account>> {
        self.inner.ensure_available()?;
        if !self.row_guards.contains_key(&key) {
            let Some(lock) = self.inner.row_lock(key) else {
                return Ok(None);
            };
            let guard = self.inner.acquire(lock, format!("account {}", key)).await?;
            self.row_guards.insert(key, guard);
            debug!(account = %key, "account row locked");
        }
        Ok(self.visible_account(key))
    }

    async fn update_balance(&mut self, key: AccountKey, balance: Decimal) -> Result<Account> {
        if self.lock_account(key).await?.is_none() {
            return Err(Error::AccountNotFound(key));
        }
        let row = Account {
            key,
            balance,
            updated_at: Utc::now(),
        };
        self.pending_balances.insert(key, row.clone());
        Ok(row)
    }

    async fn commit(mut self) -> Result<()> {
        self.inner.ensure_available()?;

        let pending_documents = std::mem::take(&mut self.pending_documents);
        if !pending_documents.is_empty() {
            let mut documents = self.inner.documents.write();
            for doc in &pending_documents {
                let clash = documents.iter().any(|existing| {
                    (existing.partition == doc.partition && existing.sequence == doc.sequence)
                        || existing.code == doc.code
                });
                if clash {
                    return Err(Error::SequenceConflict(format!(
                        "{}: committed concurrently by another transaction",
                        doc.code
                    )));
                }
            }
            documents.extend(pending_documents);
        }

        let pending_balances = std::mem::take(&mut self.pending_balances);
        if !pending_balances.is_empty() {
            let mut accounts = self.inner.accounts.write();
            for (key, row) in pending_balances {
                if let Some(slot) = accounts.get_mut(&key) {
                    slot.row = row;
                }
            }
        }

        // Locks are released when `self` drops here
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
