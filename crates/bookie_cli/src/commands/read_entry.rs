//! Read-entry command implementation.

use super::hex_prefix;
use bookie_core::{
    open_ledger_storage, parse_entry_ids, parse_last_add_confirmed, CoreResult, LedgerStorage,
    StorageConfig, ENTRY_ID_HEADER_SIZE, ENTRY_LAC_HEADER_SIZE,
};
use serde::Serialize;

const PAYLOAD_PREVIEW: usize = 64;

/// An entry as printed by the shell.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Ledger id from the entry header.
    pub ledger_id: i64,
    /// Entry id from the entry header.
    pub entry_id: i64,
    /// Last-add-confirmed carried by the entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_add_confirmed: Option<i64>,
    /// Total entry size in bytes.
    pub size: usize,
    /// Hex of the first payload bytes.
    pub payload: String,
}

/// Reads one entry. `entry_id` may be `-1` for the last entry.
pub fn collect(storage: &dyn LedgerStorage, ledger_id: i64, entry_id: i64) -> CoreResult<EntryInfo> {
    let data = storage.get_entry(ledger_id, entry_id)?;
    let (ledger_id, entry_id) = parse_entry_ids(&data)?;
    let last_add_confirmed = parse_last_add_confirmed(&data);
    let header = if last_add_confirmed.is_some() {
        ENTRY_LAC_HEADER_SIZE
    } else {
        ENTRY_ID_HEADER_SIZE
    };
    Ok(EntryInfo {
        ledger_id,
        entry_id,
        last_add_confirmed,
        size: data.len(),
        payload: hex_prefix(&data[header..], PAYLOAD_PREVIEW),
    })
}

/// Runs the read-entry command.
pub fn run(
    config: &StorageConfig,
    ledger_id: i64,
    entry_id: i64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_ledger_storage(config)?;
    let entry = collect(storage.as_ref(), ledger_id, entry_id);
    storage.shutdown()?;
    let entry = entry?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        _ => {
            println!("Ledger:  {}", entry.ledger_id);
            println!("Entry:   {}", entry.entry_id);
            if let Some(lac) = entry.last_add_confirmed {
                println!("LAC:     {lac}");
            }
            println!("Size:    {} bytes", entry.size);
            println!("Payload: {}", entry.payload);
        }
    }

    Ok(())
}
