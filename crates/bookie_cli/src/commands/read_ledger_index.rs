//! Read-ledger-index command implementation.
//!
//! Reads the location index of a ledger straight from disk. The storage is
//! not opened, so the command does not take the directory locks; run it on
//! a stopped bookie to get a consistent view.

use super::CommandError;
use bookie_core::{DbLedgerStorage, LedgerStorageKind, StorageConfig};
use serde::Serialize;

/// One index entry of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Entry id.
    pub entry_id: i64,
    /// Id of the log holding the entry.
    pub log_id: u32,
    /// Byte offset of the record in the log.
    pub offset: u32,
}

/// Collects the index entries of a ledger in entry order.
pub fn collect(
    config: &StorageConfig,
    ledger_id: i64,
) -> Result<Vec<IndexEntry>, Box<dyn std::error::Error>> {
    if config.storage_kind != LedgerStorageKind::Db {
        return Err(CommandError::WrongStorage {
            command: "read-ledger-index",
            needed: LedgerStorageKind::Db,
            configured: config.storage_kind,
        }
        .into());
    }
    let mut entries = Vec::new();
    DbLedgerStorage::read_ledger_index_entries(ledger_id, config, |entry_id, log_id, offset| {
        entries.push(IndexEntry {
            entry_id,
            log_id,
            offset,
        });
        Ok(())
    })?;
    Ok(entries)
}

/// Runs the read-ledger-index command.
pub fn run(
    config: &StorageConfig,
    ledger_id: i64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(config, ledger_id)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Ledger {ledger_id}: {} entries", entries.len());
            for entry in &entries {
                println!(
                    "  entry {:>10}  log {:>8x}  offset {:>10}",
                    entry.entry_id, entry.log_id, entry.offset
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookie_core::{open_ledger_storage, LedgerStorage};
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn lists_flushed_locations() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new()
            .ledger_dir(dir.path())
            .write_buffer_size(4096)
            .buffer_pool_size(4);
        let storage = open_ledger_storage(&config).unwrap();
        for entry_id in 0..3i64 {
            let mut buf = Vec::new();
            buf.extend_from_slice(&1i64.to_be_bytes());
            buf.extend_from_slice(&entry_id.to_be_bytes());
            storage.add_entry(Bytes::from(buf)).unwrap();
        }
        storage.shutdown().unwrap();
        drop(storage);

        let entries = collect(&config, 1).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_id, 0);
        assert_eq!(entries[0].offset, 4096);
        // 16-byte entries with a 4-byte size prefix.
        assert_eq!(entries[1].offset, 4096 + 20);
        assert!(entries.iter().all(|e| e.log_id == 0));
        assert!(collect(&config, 2).unwrap().is_empty());
    }

    #[test]
    fn rejects_other_engines() {
        let config = StorageConfig::new()
            .ledger_dir("/nonexistent")
            .storage_kind(LedgerStorageKind::Interleaved);
        let err = collect(&config, 1).unwrap_err();
        assert!(err.to_string().contains("read-ledger-index"));
    }
}
