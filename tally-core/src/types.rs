//! Core types
//!
//! Balances are `Decimal` end to end; nothing here ever goes through a
//! float. Document codes are derived values and can be rebuilt from
//! (prefix, partition, sequence) at any time.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Width of the zero-padded sequence segment of a document code
pub const SEQUENCE_WIDTH: usize = 5;

const PARTITION_FORMAT: &str = "%Y%m%d";

/// Account owner key
///
/// Ordered: transfers take row locks in ascending key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey(i64);

impl AccountKey {
    /// Create new account key
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw key value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountKey {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Date partition (`YYYYMMDD`, UTC) under which sequences restart at 1
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Partition for the UTC calendar day containing `at`
    pub fn for_instant(at: DateTime<Utc>) -> Self {
        Self::for_date(at.date_naive())
    }

    /// Partition for a calendar day
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format(PARTITION_FORMAT).to_string())
    }

    /// Parse an 8-digit partition key
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidArgument(format!(
                "partition must be 8 digits: {:?}",
                s
            )));
        }
        let date = NaiveDate::parse_from_str(s, PARTITION_FORMAT)
            .map_err(|e| Error::InvalidArgument(format!("partition {:?}: {}", s, e)))?;
        Ok(Self::for_date(date))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public document identifier: `PREFIX-YYYYMMDD-NNNNN`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentCode {
    prefix: String,
    partition: PartitionKey,
    sequence: u32,
}

impl DocumentCode {
    /// Build a code from its parts
    pub fn new(prefix: impl Into<String>, partition: PartitionKey, sequence: u32) -> Self {
        Self {
            prefix: prefix.into(),
            partition,
            sequence,
        }
    }

    /// Parse a code produced by [`DocumentCode::to_string`]
    pub fn parse(code: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("malformed document code: {:?}", code));

        let mut parts = code.rsplitn(3, '-');
        let sequence = parts.next().ok_or_else(invalid)?;
        let partition = parts.next().ok_or_else(invalid)?;
        let prefix = parts.next().ok_or_else(invalid)?;

        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        if sequence.len() < SEQUENCE_WIDTH || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let sequence: u32 = sequence.parse().map_err(|_| invalid())?;
        if sequence == 0 {
            return Err(invalid());
        }

        Ok(Self {
            prefix: prefix.to_string(),
            partition: PartitionKey::parse(partition)?,
            sequence,
        })
    }

    /// Prefix segment
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Partition segment
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Sequence within the partition
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for DocumentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:0width$}",
            self.prefix,
            self.partition,
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

/// A committed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Surrogate row id
    pub id: i64,

    /// Public identifier
    pub code: String,

    /// Date partition
    pub partition: PartitionKey,

    /// Sequence within the partition (1-based)
    pub sequence: u32,

    /// Opaque caller payload
    pub payload: serde_json::Value,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Document row about to be inserted
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Public identifier
    pub code: DocumentCode,

    /// Opaque caller payload
    pub payload: serde_json::Value,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner key
    pub key: AccountKey,

    /// Current balance
    pub balance: Decimal,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

/// Which balance path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMethod {
    /// Unlocked read, delay, unconditional write
    WithoutTransaction,
    /// Row-locked read-modify-write inside one transaction
    WithTransaction,
}

impl UpdateMethod {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMethod::WithoutTransaction => "without-transaction",
            UpdateMethod::WithTransaction => "with-transaction",
        }
    }
}

/// Outcome of a single-account balance update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResult {
    /// Account updated
    pub account: AccountKey,
    /// Balance read before the update
    pub previous_balance: Decimal,
    /// Signed delta applied
    pub delta: Decimal,
    /// Balance written
    pub new_balance: Decimal,
    /// Path taken
    pub method: UpdateMethod,
}

/// Outcome of a two-account transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Debited account
    pub from: AccountKey,
    /// Credited account
    pub to: AccountKey,
    /// Amount moved
    pub amount: Decimal,
    /// Debited balance read under lock
    pub from_previous_balance: Decimal,
    /// Debited balance written
    pub from_new_balance: Decimal,
    /// Credited balance read under lock
    pub to_previous_balance: Decimal,
    /// Credited balance written
    pub to_new_balance: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partition_uses_utc_day() {
        let late = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(PartitionKey::for_instant(late).as_str(), "20240309");

        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(PartitionKey::for_instant(midnight).as_str(), "20240310");
    }

    #[test]
    fn test_code_format() {
        let partition = PartitionKey::parse("20240309").unwrap();
        let code = DocumentCode::new("INV", partition, 42);
        assert_eq!(code.to_string(), "INV-20240309-00042");
    }

    #[test]
    fn test_code_grows_past_padding() {
        let partition = PartitionKey::parse("20240309").unwrap();
        let code = DocumentCode::new("INV", partition, 123_456);
        assert_eq!(code.to_string(), "INV-20240309-123456");
        assert_eq!(DocumentCode::parse("INV-20240309-123456").unwrap().sequence(), 123_456);
    }

    #[test]
    fn test_parse_rejects_malformed_codes() {
        for bad in [
            "",
            "INV",
            "INV-20240309",
            "INV-2024039-00001",
            "INV-20241399-00001",
            "INV-20240309-1",
            "INV-20240309-00000",
            "-20240309-00001",
            "IN V-20240309-00001",
            "INV-20240309-0000x",
        ] {
            assert!(
                matches!(DocumentCode::parse(bad), Err(Error::InvalidArgument(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_update_method_serializes_kebab_case() {
        let json = serde_json::to_string(&UpdateMethod::WithTransaction).unwrap();
        assert_eq!(json, "\"with-transaction\"");
        assert_eq!(UpdateMethod::WithoutTransaction.as_str(), "without-transaction");
    }
}
