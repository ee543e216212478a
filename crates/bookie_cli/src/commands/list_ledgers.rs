//! List-ledgers command implementation.

use bookie_core::{open_ledger_storage, parse_entry_ids, CoreResult, LedgerStorage, StorageConfig};
use serde::Serialize;

/// One ledger held by the storage.
#[derive(Debug, Serialize)]
pub struct LedgerInfo {
    /// Ledger id.
    pub ledger_id: i64,
    /// Fence flag; absent when the ledger is in limbo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fenced: Option<bool>,
    /// Length of the master key in bytes.
    pub master_key_len: usize,
    /// Highest stored entry id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_entry: Option<i64>,
    /// Last-add-confirmed recovered from the storage.
    pub last_add_confirmed: i64,
}

/// Collects every ledger of the storage, in id order.
pub fn collect(storage: &dyn LedgerStorage) -> CoreResult<Vec<LedgerInfo>> {
    let mut ledgers = Vec::new();
    for ledger_id in storage.get_active_ledgers_in_range(0, i64::MAX)? {
        let fenced = match storage.is_fenced(ledger_id) {
            Ok(fenced) => Some(fenced),
            Err(e) if e.is_data_unknown() => None,
            Err(e) => return Err(e),
        };
        let last_entry = match storage.get_last_entry(ledger_id) {
            Ok(entry) => Some(parse_entry_ids(&entry)?.1),
            Err(e) if e.is_not_found() || e.is_data_unknown() => None,
            Err(e) => return Err(e),
        };
        ledgers.push(LedgerInfo {
            ledger_id,
            fenced,
            master_key_len: storage.read_master_key(ledger_id)?.len(),
            last_entry,
            last_add_confirmed: storage.get_last_add_confirmed(ledger_id)?,
        });
    }
    Ok(ledgers)
}

/// Runs the list-ledgers command.
pub fn run(config: &StorageConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_ledger_storage(config)?;
    let ledgers = collect(storage.as_ref());
    storage.shutdown()?;
    let ledgers = ledgers?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&ledgers)?);
        }
        _ => {
            print_text_output(&ledgers);
        }
    }

    Ok(())
}

fn print_text_output(ledgers: &[LedgerInfo]) {
    println!("{} ledger(s)", ledgers.len());
    println!();
    println!("{:>20}  {:>7}  {:>12}  {:>12}", "LEDGER", "FENCED", "LAST ENTRY", "LAC");
    for ledger in ledgers {
        let fenced = match ledger.fenced {
            Some(true) => "yes",
            Some(false) => "no",
            None => "limbo",
        };
        let last_entry = ledger
            .last_entry
            .map_or_else(|| "-".to_string(), |e| e.to_string());
        println!(
            "{:>20}  {:>7}  {:>12}  {:>12}",
            ledger.ledger_id, fenced, last_entry, ledger.last_add_confirmed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn entry(ledger_id: i64, entry_id: i64) -> Bytes {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ledger_id.to_be_bytes());
        buf.extend_from_slice(&entry_id.to_be_bytes());
        buf.extend_from_slice(&(entry_id - 1).to_be_bytes());
        Bytes::from(buf)
    }

    #[test]
    fn lists_ledgers_in_order() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new()
            .ledger_dirs(vec![dir.path().join("a"), dir.path().join("b")])
            .write_buffer_size(4096)
            .buffer_pool_size(4);
        let storage = open_ledger_storage(&config).unwrap();
        for ledger_id in [5, 2] {
            storage.set_master_key(ledger_id, b"key").unwrap();
            for entry_id in 0..3 {
                storage.add_entry(entry(ledger_id, entry_id)).unwrap();
            }
        }
        storage.set_master_key(9, b"").unwrap();
        storage.set_fenced(5).unwrap();

        let ledgers = collect(storage.as_ref()).unwrap();
        storage.shutdown().unwrap();

        let ids: Vec<_> = ledgers.iter().map(|l| l.ledger_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(ledgers[0].last_entry, Some(2));
        assert_eq!(ledgers[0].last_add_confirmed, 1);
        assert_eq!(ledgers[1].fenced, Some(true));
        assert_eq!(ledgers[1].master_key_len, 3);
        assert_eq!(ledgers[2].last_entry, None);
        assert_eq!(ledgers[2].last_add_confirmed, -1);
    }
}
