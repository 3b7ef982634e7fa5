//! CLI argument definitions for ferrokraken.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sync` | Pull new records for the selected resources into the warehouse |
//! | `resources` | List the resources the engine knows how to sync |
//! | `state show` | Show persisted cursors and stored row counts |
//! | `state reset` | Forget the cursor of one resource, or of all of them |
//!
//! # Examples
//!
//! ```bash
//! # Incremental sync of every resource
//! ferrokraken sync
//!
//! # Only executions for one contract, starting at a fixed instant
//! ferrokraken sync --resources executions --since 2024-01-01T00:00:00Z \
//!     --filter executions.tradeable=PF_XBTUSD
//!
//! # Start account_log over from scratch
//! ferrokraken state reset account_log
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable incremental sync for the Kraken Futures REST API.
#[derive(Debug, Parser)]
#[command(
    name = "ferrokraken",
    author,
    version,
    about = "Resumable incremental sync for the Kraken Futures REST API",
    long_about = "Pulls executions, account log entries, position history, tickers, and open \
positions from Kraken Futures into a local DuckDB warehouse. Incremental resources resume from \
their last committed cursor.\n\
\n\
Credentials are read from KRAKEN_FUTURES_API_KEY and KRAKEN_FUTURES_API_SECRET."
)]
pub struct Cli {
    /// DuckDB warehouse file. Defaults to $FERROKRAKEN_HOME/warehouse.duckdb.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync resources and print the run report as JSON.
    ///
    /// Exit status is 0 when every requested resource succeeded, 3 when any failed,
    /// 130 when interrupted, and 2 for invalid input.
    Sync(SyncArgs),

    /// List resource descriptors.
    Resources,

    /// Inspect or reset persisted cursors.
    State(StateArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Resources to sync (comma separated or repeated). Defaults to all of them.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub resources: Vec<String>,

    /// Start of the window when a resource has no cursor yet. Epoch seconds,
    /// epoch milliseconds, or an ISO-8601 timestamp.
    #[arg(long)]
    pub since: Option<String>,

    /// Records requested per page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Resources synced at the same time.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Aggregate request rate across all resources; 0 disables throttling.
    #[arg(long)]
    pub requests_per_second: Option<u32>,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Extra query filter, e.g. `executions.tradeable=PF_XBTUSD`.
    #[arg(long = "filter", value_name = "RESOURCE.PARAM=VALUE")]
    pub filters: Vec<String>,

    /// Fetch and report without writing records or cursors.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct StateArgs {
    #[command(subcommand)]
    pub command: StateCommand,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Show cursors and row counts for every resource.
    Show,

    /// Remove a cursor so the next sync starts over.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Resource whose cursor is removed.
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub resource: Option<String>,

    /// Remove every cursor.
    #[arg(long, default_value_t = false)]
    pub all: bool,
}
