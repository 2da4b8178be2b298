//! Error types for the core
//!
//! Every variant maps to one kind the request layer can translate into a
//! status class. Kinds must survive end to end, so store errors are
//! classified here instead of being passed through as opaque strings.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::AccountKey;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors
#[derive(Error, Debug)]
pub enum Error {
    /// No account row for the given key
    #[error("Account not found: {0}")]
    AccountNotFound(AccountKey),

    /// No document carries the given code
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Source account cannot cover a transfer
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount the operation needed
        required: Decimal,
        /// Balance observed under lock
        available: Decimal,
    },

    /// Two documents claimed the same (partition, sequence) slot
    #[error("Sequence conflict: {0}")]
    SequenceConflict(String),

    /// Lock wait or statement timeout; the caller may retry
    #[error("Contention: {0}")]
    Contention(String),

    /// Connectivity or fatal store failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Rejected before any store interaction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable snake-case kind, used by the API layer for status mapping
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::AccountNotFound(_) => "not_found",
            Error::DocumentNotFound(_) => "not_found",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::SequenceConflict(_) => "sequence_conflict",
            Error::Contention(_) => "contention",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Config(_) => "configuration_error",
        }
    }

    /// Whether retrying the same call can succeed without backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Contention(_))
    }
}

/// SQLSTATE codes that mean "gave up waiting", not "broken"
const CONTENTION_CODES: &[&str] = &[
    "55P03", // lock_not_available (lock_timeout)
    "40P01", // deadlock_detected
    "40001", // serialization_failure
    "57014", // query_canceled (statement_timeout)
];

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                if CONTENTION_CODES.contains(&&*code) {
                    return Error::Contention(db.message().to_string());
                }
                if code == UNIQUE_VIOLATION {
                    return Error::SequenceConflict(db.message().to_string());
                }
            }
        }
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}
