//! Race harness CLI
//!
//! Runs the concurrency demonstrations against Postgres, or against an
//! in-process store with `--memory`, and prints the report as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use tally_core::{
    metrics::Metrics, AccountKey, Config, LedgerMutator, MemoryStore, PgStore, RaceHarness,
    SequenceAllocator, Store,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally-race")]
#[command(about = "Concurrency demonstrations for the tally core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults plus environment overrides when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use an in-process store instead of Postgres
    #[arg(long, global = true)]
    memory: bool,

    /// Opening balance for accounts named on the command line (with --memory)
    #[arg(long, global = true, default_value = "1000")]
    seed: Decimal,

    /// Print Prometheus metrics to stderr after the run
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply deltas concurrently through the unlocked and the locked path
    Balance {
        /// Account key
        #[arg(short, long)]
        account: i64,

        /// Signed delta, repeatable
        #[arg(short, long = "delta", required = true, allow_negative_numbers = true)]
        deltas: Vec<Decimal>,
    },

    /// Allocate document codes concurrently
    Sequence {
        /// Number of concurrent allocations
        #[arg(short = 'n', long, default_value_t = tally_core::harness::DEFAULT_SEQUENCE_PROOF_COUNT)]
        count: usize,
    },

    /// Move funds between two accounts
    Transfer {
        #[arg(long)]
        from: i64,

        #[arg(long)]
        to: i64,

        #[arg(long)]
        amount: Decimal,
    },
}

impl Commands {
    fn accounts(&self) -> Vec<AccountKey> {
        match self {
            Commands::Balance { account, .. } => vec![AccountKey::new(*account)],
            Commands::Sequence { .. } => Vec::new(),
            Commands::Transfer { from, to, .. } => vec![AccountKey::new(*from), AccountKey::new(*to)],
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    init_tracing(config.log_json);
    tracing::info!(service = %config.service_name, memory = cli.memory, "starting tally-race");

    let metrics = Metrics::new().context("registering metrics")?;

    if cli.memory {
        let store = match config.database.lock_timeout() {
            Some(limit) => MemoryStore::with_lock_timeout(limit),
            None => MemoryStore::new(),
        };
        for key in cli.command.accounts() {
            store.open_account(key, cli.seed);
        }
        run(store, &config, &cli.command, metrics.clone()).await?;
    } else {
        let store = PgStore::connect(&config.database)
            .await
            .context("connecting to Postgres")?;
        run(store, &config, &cli.command, metrics.clone()).await?;
    }

    if cli.metrics {
        eprintln!("{}", metrics.render());
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run<S: Store>(
    store: S,
    config: &Config,
    command: &Commands,
    metrics: Metrics,
) -> anyhow::Result<()> {
    let ledger = LedgerMutator::new(store.clone(), &config.ledger).with_metrics(metrics.clone());
    let allocator = SequenceAllocator::new(store, &config.sequence).with_metrics(metrics);
    let harness = RaceHarness::new(&ledger, &allocator);

    match command {
        Commands::Balance { account, deltas } => {
            let report = harness
                .prove_race_condition(AccountKey::new(*account), deltas)
                .await?;
            print_json(&report)
        }
        Commands::Sequence { count } => {
            let report = harness.prove_sequence_allocation(*count).await?;
            print_json(&report)
        }
        Commands::Transfer { from, to, amount } => {
            let result = ledger
                .transfer(AccountKey::new(*from), AccountKey::new(*to), *amount)
                .await?;
            print_json(&result)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
