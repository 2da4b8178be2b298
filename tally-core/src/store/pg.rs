use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow, Postgres};
use std::time::Duration;
use tracing::debug;

use super::{Store, Transaction};
use crate::{
    config::DatabaseConfig,
    types::{Account, AccountKey, Document, NewDocument, PartitionKey},
    Error, Result,
};

/// Reference DDL for the two tables the core touches
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

const ACCOUNT_COLUMNS: &str = "user_id, balance, updated_at";
const DOCUMENT_COLUMNS: &str = "id, code, date_prefix, sequence_number, data, created_at";

#[derive(FromRow)]
struct AccountRow {
    user_id: i64,
    balance: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            key: AccountKey::new(row.user_id),
            balance: row.balance,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: i64,
    code: String,
    date_prefix: String,
    sequence_number: i32,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = Error;

    fn try_from(row: DocumentRow) -> Result<Self> {
        let partition = PartitionKey::parse(row.date_prefix.trim())
            .map_err(|e| Error::StoreUnavailable(format!("corrupt document {}: {}", row.id, e)))?;
        let sequence = u32::try_from(row.sequence_number).map_err(|_| {
            Error::StoreUnavailable(format!(
                "corrupt document {}: sequence {}",
                row.id, row.sequence_number
            ))
        })?;

        Ok(Document {
            id: row.id,
            code: row.code,
            partition,
            sequence,
            payload: row.data,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    /// Connect a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        Ok(Self::from_pool(pool, config.lock_timeout()))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, lock_timeout: Option<Duration>) -> Self {
        Self { pool, lock_timeout }
    }

    /// Connection pool, for queries outside the core
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they are missing
    pub async fn apply_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }

    /// Create or reset an account. Account creation is owned by the caller,
    /// this exists for seeding and fixtures.
    pub async fn open_account(&self, key: AccountKey, balance: Decimal) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            INSERT INTO accounts (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET balance = EXCLUDED.balance, updated_at = NOW()
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(key.get())
        .bind(balance)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction> {
        let mut tx = self.pool.begin().await?;

        if let Some(timeout) = self.lock_timeout {
            // SET takes no bind parameters
            sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgTransaction { tx })
    }

    async fn account(&self, key: AccountKey) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM accounts WHERE user_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(key.get())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    #[cfg(feature = "race-harness")]
    async fn write_balance(&self, key: AccountKey, balance: Decimal) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            UPDATE accounts SET balance = $1, updated_at = NOW()
            WHERE user_id = $2
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(balance)
        .bind(key.get())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    async fn document(&self, code: &str) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM documents WHERE code = $1",
            DOCUMENT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Document::try_from).transpose()
    }

    async fn documents(&self, limit: i64, offset: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            SELECT {} FROM documents
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Document::try_from).collect()
    }
}

/// Open Postgres transaction
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn lock_documents(&mut self) -> Result<()> {
        sqlx::query("LOCK TABLE documents IN EXCLUSIVE MODE")
            .execute(&mut *self.tx)
            .await?;
        debug!("documents table locked");
        Ok(())
    }

    async fn max_sequence(&mut self, partition: &PartitionKey) -> Result<u32> {
        let last: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM documents WHERE date_prefix = $1",
        )
        .bind(partition.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        u32::try_from(last)
            .map_err(|_| Error::StoreUnavailable(format!("negative sequence in {}", partition)))
    }

    async fn insert_document(&mut self, document: NewDocument) -> Result<Document> {
        let code = document.code.to_string();
        let sequence = i32::try_from(document.code.sequence()).map_err(|_| {
            Error::SequenceConflict(format!("{}: sequence out of range", code))
        })?;

        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            INSERT INTO documents (code, date_prefix, sequence_number, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(&code)
        .bind(document.code.partition().as_str())
        .bind(sequence)
        .bind(&document.payload)
        .bind(document.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match Error::from(e) {
            Error::SequenceConflict(msg) => Error::SequenceConflict(format!("{}: {}", code, msg)),
            other => other,
        })?;

        Document::try_from(row)
    }

    async fn lock_account(&mut self, key: AccountKey) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {} FROM accounts WHERE user_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(key.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        if row.is_some() {
            debug!(account = %key, "account row locked");
        }
        Ok(row.map(Account::from))
    }

    async fn update_balance(&mut self, key: AccountKey, balance: Decimal) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            r#"
            UPDATE accounts SET balance = $1, updated_at = NOW()
            WHERE user_id = $2
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(balance)
        .bind(key.get())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Account::from).ok_or(Error::AccountNotFound(key))
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
