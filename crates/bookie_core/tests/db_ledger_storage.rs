//! Integration tests for the multi-directory ledger storage.

use bookie_core::gc::AllLedgersActive;
use bookie_core::{
    CoreError, DbLedgerStorage, EntryLocation, LedgerStorage, LogLocation, StorageConfig,
    StorageStateFlag, LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

/// Builds an entry carrying `entry_id - 1` as its last-add-confirmed.
fn entry(ledger_id: i64, entry_id: i64) -> Bytes {
    let mut buf = Vec::new();
    buf.extend_from_slice(&ledger_id.to_be_bytes());
    buf.extend_from_slice(&entry_id.to_be_bytes());
    buf.extend_from_slice(&(entry_id - 1).to_be_bytes());
    buf.extend_from_slice(format!("payload {ledger_id}:{entry_id}").as_bytes());
    Bytes::from(buf)
}

fn config(root: &Path, dirs: usize) -> StorageConfig {
    StorageConfig::new()
        .ledger_dirs((0..dirs).map(|i| root.join(format!("ledgers{i}"))).collect())
        .write_buffer_size(8192)
        .buffer_pool_size(4)
        .read_ahead_batch_size(4)
}

fn open(config: &StorageConfig) -> DbLedgerStorage {
    DbLedgerStorage::open(config, Arc::new(AllLedgersActive)).unwrap()
}

#[test]
fn ledgers_are_routed_by_id() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 2));

    for ledger_id in 0..4 {
        storage.set_master_key(ledger_id, b"key").unwrap();
        storage.add_entry(entry(ledger_id, 0)).unwrap();
    }

    let engines = storage.get_ledger_storage_list();
    assert_eq!(engines.len(), 2);
    assert!(engines[0].ledger_exists(0).unwrap());
    assert!(engines[0].ledger_exists(2).unwrap());
    assert!(!engines[0].ledger_exists(1).unwrap());
    assert!(engines[1].ledger_exists(3).unwrap());
    assert!(!engines[1].ledger_exists(2).unwrap());

    assert_eq!(storage.get_entry(3, 0).unwrap(), entry(3, 0));
    assert_eq!(storage.get_active_ledgers_in_range(0, 4).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(storage.get_active_ledgers_in_range(1, 3).unwrap(), vec![1, 2]);
    storage.shutdown().unwrap();
}

#[test]
fn negative_ids_are_rejected() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 2));

    assert!(matches!(
        storage.ledger_exists(-1),
        Err(CoreError::InvalidLedgerId { ledger_id: -1 })
    ));
    assert!(storage.set_master_key(-3, b"key").unwrap_err().is_validation());
    assert!(storage.add_entry(entry(-2, 0)).unwrap_err().is_validation());
    assert!(storage.add_entry(entry(2, -4)).unwrap_err().is_validation());
    assert!(storage.get_entry(-5, 0).unwrap_err().is_validation());

    let short = Bytes::from_static(b"too short");
    assert!(matches!(
        storage.add_entry(short),
        Err(CoreError::InvalidEntry { .. })
    ));

    let mut bad_lac = Vec::new();
    bad_lac.extend_from_slice(&1i64.to_be_bytes());
    bad_lac.extend_from_slice(&0i64.to_be_bytes());
    bad_lac.extend_from_slice(&(-7i64).to_be_bytes());
    assert!(matches!(
        storage.add_entry(Bytes::from(bad_lac)),
        Err(CoreError::InvalidEntry { .. })
    ));
    assert!(!storage.ledger_exists(1).unwrap());
    assert_eq!(storage.add_entry(entry(1, 0)).unwrap(), 0);
    storage.shutdown().unwrap();
}

#[test]
fn master_key_is_fixed_once_set() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 1));

    assert!(matches!(
        storage.read_master_key(9),
        Err(CoreError::NoLedger { ledger_id: 9 })
    ));
    storage.set_master_key(9, b"first").unwrap();
    storage.set_master_key(9, b"first").unwrap();
    assert!(matches!(
        storage.set_master_key(9, b"second"),
        Err(CoreError::MasterKeyMismatch { ledger_id: 9 })
    ));
    assert_eq!(storage.read_master_key(9).unwrap(), b"first".to_vec());

    storage.set_master_key(10, b"").unwrap();
    assert!(storage.ledger_exists(10).unwrap());
    assert!(storage.read_master_key(10).unwrap().is_empty());
    storage.shutdown().unwrap();
}

#[test]
fn missing_entries_and_ledgers() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 1));

    assert!(matches!(
        storage.get_entry(4, 0),
        Err(CoreError::NoLedger { ledger_id: 4 })
    ));
    storage.set_master_key(4, b"key").unwrap();
    assert!(matches!(
        storage.get_entry(4, 0),
        Err(CoreError::NoEntry {
            ledger_id: 4,
            entry_id: 0
        })
    ));
    assert!(storage.get_entry(4, LAST_ADD_CONFIRMED).unwrap_err().is_not_found());

    storage.add_entry(entry(4, 0)).unwrap();
    storage.add_entry(entry(4, 2)).unwrap();
    assert!(storage.entry_exists(4, 2).unwrap());
    assert!(!storage.entry_exists(4, 1).unwrap());
    storage.flush().unwrap();
    assert!(matches!(
        storage.get_entry(4, 1),
        Err(CoreError::NoEntry { entry_id: 1, .. })
    ));
    storage.shutdown().unwrap();
}

#[test]
fn entries_survive_restart() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 2);

    let storage = open(&config);
    for ledger_id in [3, 4] {
        storage.set_master_key(ledger_id, b"key").unwrap();
        for entry_id in 0..10 {
            assert_eq!(storage.add_entry(entry(ledger_id, entry_id)).unwrap(), entry_id);
        }
    }
    // Served from the write cache before any flush.
    assert_eq!(storage.get_entry(3, 7).unwrap(), entry(3, 7));
    assert_eq!(storage.get_last_add_confirmed(3).unwrap(), 8);
    assert!(storage.set_fenced(4).unwrap());
    storage.shutdown().unwrap();
    drop(storage);

    let storage = open(&config);
    for ledger_id in [3, 4] {
        for entry_id in 0..10 {
            assert_eq!(
                storage.get_entry(ledger_id, entry_id).unwrap(),
                entry(ledger_id, entry_id)
            );
        }
        assert_eq!(
            storage.get_entry(ledger_id, LAST_ADD_CONFIRMED).unwrap(),
            entry(ledger_id, 9)
        );
        assert_eq!(storage.get_last_add_confirmed(ledger_id).unwrap(), 8);
    }
    assert!(!storage.is_fenced(3).unwrap());
    assert!(storage.is_fenced(4).unwrap());
    assert!(!storage.set_fenced(4).unwrap());
    storage.shutdown().unwrap();
}

#[test]
fn deleted_ledger_is_gone() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 2));

    storage.set_master_key(5, b"key").unwrap();
    for entry_id in 0..3 {
        storage.add_entry(entry(5, entry_id)).unwrap();
    }
    storage.flush().unwrap();
    storage.add_entry(entry(5, 3)).unwrap();

    storage.delete_ledger(5).unwrap();
    assert!(!storage.ledger_exists(5).unwrap());
    assert!(!storage.entry_exists(5, 3).unwrap());
    assert!(matches!(
        storage.get_entry(5, 1),
        Err(CoreError::NoLedger { ledger_id: 5 })
    ));
    assert!(storage.get_active_ledgers_in_range(0, 10).unwrap().is_empty());
    storage.shutdown().unwrap();
}

#[test]
fn explicit_lac_round_trips() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 1));

    storage.set_master_key(6, b"key").unwrap();
    assert_eq!(storage.get_explicit_lac(6).unwrap(), None);
    storage
        .set_explicit_lac(6, Bytes::from_static(b"lac-7"))
        .unwrap();
    assert_eq!(
        storage.get_explicit_lac(6).unwrap(),
        Some(Bytes::from_static(b"lac-7"))
    );
    storage.shutdown().unwrap();
}

#[test]
fn storage_state_flags_persist() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 2);

    let storage = open(&config);
    assert!(storage.get_storage_state_flags().unwrap().is_empty());
    storage
        .set_storage_state_flag(StorageStateFlag::NeedsIntegrityCheck)
        .unwrap();
    storage.shutdown().unwrap();
    drop(storage);

    let storage = open(&config);
    assert!(storage
        .get_storage_state_flags()
        .unwrap()
        .contains(&StorageStateFlag::NeedsIntegrityCheck));
    storage
        .clear_storage_state_flag(StorageStateFlag::NeedsIntegrityCheck)
        .unwrap();
    assert!(storage.get_storage_state_flags().unwrap().is_empty());
    storage.shutdown().unwrap();
}

#[test]
fn limbo_ledgers_answer_data_unknown() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 1));

    storage.set_limbo_state(8).unwrap();
    assert!(storage.has_limbo_state(8).unwrap());
    assert!(!storage.ledger_exists(8).unwrap());
    assert!(storage.is_fenced(8).unwrap_err().is_data_unknown());
    assert!(storage.get_entry(8, 0).unwrap_err().is_data_unknown());

    storage.clear_limbo_state(8).unwrap();
    assert!(matches!(
        storage.get_entry(8, 0),
        Err(CoreError::NoLedger { ledger_id: 8 })
    ));
    storage.shutdown().unwrap();
}

#[test]
fn shutdown_is_final() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 2));
    storage.set_master_key(1, b"key").unwrap();
    storage.add_entry(entry(1, 0)).unwrap();

    storage.shutdown().unwrap();
    assert!(matches!(storage.shutdown(), Err(CoreError::ShutDown)));
    assert!(matches!(storage.get_entry(1, 0), Err(CoreError::ShutDown)));
    assert!(matches!(
        storage.add_entry(entry(1, 1)),
        Err(CoreError::ShutDown)
    ));
}

#[test]
fn second_open_of_a_directory_is_refused() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 1);
    let storage = open(&config);

    let err = DbLedgerStorage::open(&config, Arc::new(AllLedgersActive)).unwrap_err();
    assert!(matches!(err, CoreError::DirectoryLocked { .. }));
    storage.shutdown().unwrap();
}

#[test]
fn index_entries_are_readable_offline() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 2);

    let storage = open(&cfg);
    storage.set_master_key(7, b"key").unwrap();
    for entry_id in 0..6 {
        storage.add_entry(entry(7, entry_id)).unwrap();
    }
    storage.shutdown().unwrap();
    drop(storage);

    let mut visited = Vec::new();
    let count = DbLedgerStorage::read_ledger_index_entries(7, &cfg, |entry_id, log_id, offset| {
        visited.push((entry_id, log_id, offset));
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 6);
    assert_eq!(
        visited.iter().map(|(e, _, _)| *e).collect::<Vec<_>>(),
        (0..6).collect::<Vec<_>>()
    );
    assert!(visited.windows(2).all(|w| w[0].2 < w[1].2));

    let fresh = tempdir().unwrap();
    let err = DbLedgerStorage::read_ledger_index_entries(7, &config(fresh.path(), 1), |_, _, _| {
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig { .. }));
}

#[test]
fn location_updates_stay_within_one_directory() {
    let dir = tempdir().unwrap();
    let storage = open(&config(dir.path(), 2));
    for ledger_id in [1, 2] {
        storage.set_master_key(ledger_id, b"key").unwrap();
        storage.add_entry(entry(ledger_id, 0)).unwrap();
    }
    storage.flush().unwrap();

    // Each directory holds one ledger, written at the start of its first log.
    let first_record = LogLocation::new(0, 4096);
    let split = [
        EntryLocation::new(1, 0, first_record),
        EntryLocation::new(2, 0, first_record),
    ];
    let err = storage.update_entries_locations(&split).unwrap_err();
    assert!(matches!(err, CoreError::SplitLocationBatch { directories: 2 }));
    assert!(err.is_validation());
    assert_eq!(storage.get_entry(1, 0).unwrap(), entry(1, 0));
    assert_eq!(storage.get_entry(2, 0).unwrap(), entry(2, 0));

    storage
        .update_entries_locations(&[EntryLocation::new(2, 0, first_record)])
        .unwrap();
    assert_eq!(storage.get_entry(2, 0).unwrap(), entry(2, 0));
    storage.update_entries_locations(&[]).unwrap();
    storage.shutdown().unwrap();
}

#[test]
fn adds_racing_flushes_are_never_lost() {
    const WRITERS: i64 = 4;
    const ENTRIES: i64 = 500;

    let dir = tempdir().unwrap();
    let storage = Arc::new(open(&config(dir.path(), 2)));
    let done = Arc::new(AtomicBool::new(false));

    let flusher = {
        let storage = Arc::clone(&storage);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut flushes = 0;
            while !done.load(Ordering::Acquire) {
                storage.flush().unwrap();
                flushes += 1;
            }
            flushes
        })
    };
    let writers: Vec<_> = (0..WRITERS)
        .map(|ledger_id| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                storage.set_master_key(ledger_id, b"key").unwrap();
                for entry_id in 0..ENTRIES {
                    assert_eq!(storage.add_entry(entry(ledger_id, entry_id)).unwrap(), entry_id);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(flusher.join().unwrap() > 0);

    for ledger_id in 0..WRITERS {
        for entry_id in 0..ENTRIES {
            assert_eq!(
                storage.get_entry(ledger_id, entry_id).unwrap(),
                entry(ledger_id, entry_id)
            );
        }
        assert_eq!(storage.get_last_add_confirmed(ledger_id).unwrap(), ENTRIES - 2);
    }

    storage.flush().unwrap();
    storage.shutdown().unwrap();
    drop(storage);

    let storage = open(&config(dir.path(), 2));
    for ledger_id in 0..WRITERS {
        assert_eq!(
            storage.get_entry(ledger_id, LAST_ADD_CONFIRMED).unwrap(),
            entry(ledger_id, ENTRIES - 1)
        );
        assert_eq!(
            storage.get_entry(ledger_id, ENTRIES / 2).unwrap(),
            entry(ledger_id, ENTRIES / 2)
        );
    }
    storage.shutdown().unwrap();
}
