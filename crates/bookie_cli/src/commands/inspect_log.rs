//! Inspect-log command implementation.

use super::{hex_prefix, CommandError};
use bookie_core::dirs::current_dir;
use bookie_core::{scan_log_bytes, StorageConfig, ENTRY_LAC_HEADER_SIZE};
use bookie_storage::{list_log_ids, log_filename, FileBackend, StorageBackend};
use serde::Serialize;

/// Which records to report.
#[derive(Debug, Default, Clone)]
pub struct Filter {
    /// Only this log.
    pub log_id: Option<u32>,
    /// Only entries of this ledger.
    pub ledger_id: Option<i64>,
    /// At most this many records.
    pub limit: Option<usize>,
}

/// Summary of one entry log file.
#[derive(Debug, Serialize)]
pub struct LogInfo {
    /// Log id.
    pub log_id: u32,
    /// File path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Number of entries in the log.
    pub entries: usize,
}

/// One record found in a log.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    /// Log id.
    pub log_id: u32,
    /// Byte offset of the record.
    pub offset: u32,
    /// Ledger id from the entry header.
    pub ledger_id: i64,
    /// Entry id from the entry header.
    pub entry_id: i64,
    /// Entry size in bytes.
    pub size: usize,
    /// Hex of the first payload bytes.
    pub payload: String,
}

/// Inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Logs walked.
    pub logs: Vec<LogInfo>,
    /// Records matching the filter.
    pub records: Vec<LogRecord>,
}

/// Walks the entry logs of every ledger directory.
pub fn collect(
    config: &StorageConfig,
    filter: &Filter,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let limit = filter.limit.unwrap_or(usize::MAX);
    let mut result = InspectResult {
        logs: Vec::new(),
        records: Vec::new(),
    };

    for ledger_dir in &config.ledger_dirs {
        let dir = current_dir(ledger_dir);
        for log_id in list_log_ids(&dir)? {
            if filter.log_id.is_some_and(|wanted| wanted != log_id) {
                continue;
            }
            let path = log_filename(&dir, log_id);
            let backend = FileBackend::open(&path)?;
            let data = backend.read_all()?;

            let records = &mut result.records;
            let entries = scan_log_bytes(log_id, &data, &mut |entry| {
                let wanted = filter.ledger_id.map_or(true, |l| l == entry.ledger_id);
                if wanted && records.len() < limit {
                    let payload = entry.data.get(ENTRY_LAC_HEADER_SIZE..).unwrap_or_default();
                    records.push(LogRecord {
                        log_id,
                        offset: entry.location.offset(),
                        ledger_id: entry.ledger_id,
                        entry_id: entry.entry_id,
                        size: entry.data.len(),
                        payload: hex_prefix(payload, 16),
                    });
                }
                Ok(())
            })?;

            result.logs.push(LogInfo {
                log_id,
                path: path.display().to_string(),
                size: data.len() as u64,
                entries,
            });
        }
    }

    if result.logs.is_empty() {
        return Err(CommandError::NoLogs.into());
    }
    Ok(result)
}

/// Runs the inspect-log command.
pub fn run(
    config: &StorageConfig,
    filter: &Filter,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(config, filter)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Entry logs:");
    for log in &result.logs {
        println!(
            "  {:>8x}  {:>12} bytes  {:>8} entries  {}",
            log.log_id, log.size, log.entries, log.path
        );
    }
    println!();
    println!("Records ({}):", result.records.len());
    for record in &result.records {
        println!(
            "  {:x}@{:<10}  ledger {:>10}  entry {:>10}  {:>8} bytes  {}",
            record.log_id,
            record.offset,
            record.ledger_id,
            record.entry_id,
            record.size,
            record.payload
        );
    }
}
