//! Bookie shell
//!
//! Command-line tools for inspecting and maintaining bookie ledger storage.
//!
//! # Commands
//!
//! - `list-ledgers` - List the ledgers held by the storage
//! - `read-entry` - Print one entry of a ledger
//! - `read-ledger-index` - Print the index entries of a ledger without
//!   opening the storage
//! - `inspect-log` - Walk the records of entry log files
//! - `compact` - Run a major garbage collection

mod commands;

use bookie_core::{LedgerStorageKind, StorageConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bookie ledger storage tools.
#[derive(Parser)]
#[command(name = "bookie-shell")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ledger directories, comma separated
    #[arg(global = true, short, long, value_delimiter = ',')]
    ledger_dirs: Vec<PathBuf>,

    /// Index directories, comma separated (default: the ledger directories)
    #[arg(global = true, short, long, value_delimiter = ',')]
    index_dirs: Vec<PathBuf>,

    /// Storage engine (db, interleaved, sorted)
    #[arg(global = true, short, long, default_value = "db")]
    storage: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the ledgers held by the storage
    ListLedgers {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print one entry of a ledger
    ReadEntry {
        /// Ledger id
        #[arg(long)]
        ledger: i64,

        /// Entry id (-1 reads the last entry)
        #[arg(long, allow_negative_numbers = true)]
        entry: i64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the index entries of a ledger without opening the storage
    ReadLedgerIndex {
        /// Ledger id
        #[arg(long)]
        ledger: i64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Walk the records of entry log files
    InspectLog {
        /// Only this log (hex id, as in the file name)
        #[arg(long)]
        log: Option<String>,

        /// Only entries of this ledger
        #[arg(long)]
        ledger: Option<i64>,

        /// Maximum number of entries to print
        #[arg(long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a major garbage collection
    Compact {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn config(&self) -> Result<StorageConfig, Box<dyn std::error::Error>> {
        if self.ledger_dirs.is_empty() {
            return Err("at least one ledger directory is required (--ledger-dirs)".into());
        }
        let kind: LedgerStorageKind = self.storage.parse()?;
        let mut config = StorageConfig::new()
            .ledger_dirs(self.ledger_dirs.clone())
            .storage_kind(kind)
            .create_if_missing(false);
        if !self.index_dirs.is_empty() {
            config = config.index_dirs(self.index_dirs.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::ListLedgers { format } => {
            commands::list_ledgers::run(&cli.config()?, format)?;
        }
        Commands::ReadEntry {
            ledger,
            entry,
            format,
        } => {
            commands::read_entry::run(&cli.config()?, *ledger, *entry, format)?;
        }
        Commands::ReadLedgerIndex { ledger, format } => {
            commands::read_ledger_index::run(&cli.config()?, *ledger, format)?;
        }
        Commands::InspectLog {
            log,
            ledger,
            limit,
            format,
        } => {
            let log_id = log
                .as_deref()
                .map(|hex| u32::from_str_radix(hex, 16))
                .transpose()
                .map_err(|e| format!("invalid log id: {e}"))?;
            let filter = commands::inspect_log::Filter {
                log_id,
                ledger_id: *ledger,
                limit: *limit,
            };
            commands::inspect_log::run(&cli.config()?, &filter, format)?;
        }
        Commands::Compact { format } => {
            commands::compact::run(&cli.config()?, format)?;
        }
        Commands::Version => {
            println!("bookie-shell v{}", env!("CARGO_PKG_VERSION"));
            println!("bookie_core v{}", bookie_core::VERSION);
        }
    }

    Ok(())
}
