//! Compact command implementation.

use bookie_core::{open_ledger_storage, GcStats, StorageConfig};

/// Runs the compact command.
pub fn run(config: &StorageConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_ledger_storage(config)?;
    let stats = storage.force_gc();
    storage.shutdown()?;
    let stats = stats?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        _ => {
            print_text_output(&stats);
        }
    }

    Ok(())
}

fn print_text_output(stats: &GcStats) {
    println!("Garbage collection ({}):", if stats.major { "major" } else { "minor" });
    println!("  Ledgers deleted:   {}", stats.ledgers_deleted);
    println!("  Logs removed:      {}", stats.logs_removed);
    println!("  Logs compacted:    {}", stats.logs_compacted);
    println!("  Entries relocated: {}", stats.entries_relocated);
    println!("  Space reclaimed:   {} bytes", stats.bytes_reclaimed);
}
