//! Configuration for the core

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name (log and metrics label)
    pub service_name: String,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Store connection settings
    pub database: DatabaseConfig,

    /// Sequence allocator settings
    pub sequence: SequenceConfig,

    /// Ledger mutator settings
    pub ledger: LedgerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "tally-core".to_string(),
            log_json: false,
            database: DatabaseConfig::default(),
            sequence: SequenceConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,

    /// Pool upper bound
    pub max_connections: u32,

    /// Pool lower bound
    pub min_connections: u32,

    /// How long to wait for a pooled connection (milliseconds)
    pub acquire_timeout_ms: u64,

    /// How long a transaction may wait on a row or table lock (milliseconds).
    /// Zero means wait indefinitely.
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/tally".to_string(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout_ms: 5_000,
            lock_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Lock wait bound, `None` when unbounded
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }
}

/// Sequence allocator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Code prefix, e.g. `INV` in `INV-20240309-00001`
    pub prefix: String,

    /// Upper bound on concurrent allocations launched by the race harness
    pub max_race_batch: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            prefix: "INV".to_string(),
            max_race_batch: 20,
        }
    }
}

/// Ledger mutator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Gap between read and write on both balance paths (milliseconds)
    pub race_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { race_delay_ms: 100 }
    }
}

impl LedgerConfig {
    /// Read/write gap
    pub fn race_delay(&self) -> Duration {
        Duration::from_millis(self.race_delay_ms)
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(max) = std::env::var("TALLY_DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = parse_var("TALLY_DATABASE_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(ms) = std::env::var("TALLY_LOCK_TIMEOUT_MS") {
            config.database.lock_timeout_ms = parse_var("TALLY_LOCK_TIMEOUT_MS", &ms)?;
        }

        if let Ok(prefix) = std::env::var("TALLY_DOCUMENT_PREFIX") {
            config.sequence.prefix = prefix;
        }

        if let Ok(ms) = std::env::var("TALLY_RACE_DELAY_MS") {
            config.ledger.race_delay_ms = parse_var("TALLY_RACE_DELAY_MS", &ms)?;
        }

        if let Ok(flag) = std::env::var("TALLY_LOG_JSON") {
            config.log_json = parse_var("TALLY_LOG_JSON", &flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(Error::Config("Database URL is required".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(Error::Config("max_connections cannot be 0".to_string()));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        let prefix = &self.sequence.prefix;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!(
                "document prefix must be non-empty and alphanumeric: {:?}",
                prefix
            )));
        }

        if self.sequence.max_race_batch == 0 {
            return Err(Error::Config("max_race_batch cannot be 0".to_string()));
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", name, value, e)))
}
