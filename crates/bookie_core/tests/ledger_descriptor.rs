//! Access control and fencing through ledger descriptors.

use bookie_core::{
    open_ledger_storage, CoreError, InMemoryJournal, LedgerDescriptor, LedgerStorage,
    StorageConfig, LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn entry(ledger_id: i64, entry_id: i64) -> Bytes {
    let mut buf = Vec::new();
    buf.extend_from_slice(&ledger_id.to_be_bytes());
    buf.extend_from_slice(&entry_id.to_be_bytes());
    buf.extend_from_slice(&(entry_id - 1).to_be_bytes());
    buf.extend_from_slice(b"data");
    Bytes::from(buf)
}

fn storage() -> (TempDir, Arc<dyn LedgerStorage>) {
    let dir = tempdir().unwrap();
    let config = StorageConfig::new()
        .ledger_dir(dir.path().join("ledgers"))
        .write_buffer_size(4096)
        .buffer_pool_size(4);
    let storage = open_ledger_storage(&config).unwrap();
    (dir, storage)
}

#[test]
fn access_requires_the_master_key() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"secret", 1, Arc::clone(&storage)).unwrap();

    handle.check_access(b"secret").unwrap();
    assert!(matches!(
        handle.check_access(b"guess"),
        Err(CoreError::UnauthorizedAccess { ledger_id: 1 })
    ));
    assert!(handle.check_access(b"").is_err());

    assert!(matches!(
        LedgerDescriptor::create(b"other", 1, Arc::clone(&storage)),
        Err(CoreError::MasterKeyMismatch { ledger_id: 1 })
    ));
    assert!(LedgerDescriptor::create(b"k", -1, storage).unwrap_err().is_validation());
}

#[test]
fn empty_master_key_is_a_key() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"", 2, storage).unwrap();
    handle.check_access(b"").unwrap();
    assert!(handle.check_access(b"x").is_err());
}

#[test]
fn entries_flow_through_the_descriptor() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"k", 3, Arc::clone(&storage)).unwrap();

    for entry_id in 0..4 {
        assert_eq!(handle.add_entry(entry(3, entry_id)).unwrap(), entry_id);
    }
    assert_eq!(handle.read_entry(2).unwrap(), entry(3, 2));
    assert_eq!(handle.read_entry(LAST_ADD_CONFIRMED).unwrap(), entry(3, 3));
    assert_eq!(handle.get_last_add_confirmed().unwrap(), 2);

    assert!(matches!(
        handle.add_entry(entry(4, 0)),
        Err(CoreError::LedgerIdMismatch {
            expected: 3,
            actual: 4
        })
    ));

    handle.set_explicit_lac(Bytes::from_static(b"lac")).unwrap();
    assert_eq!(
        handle.get_explicit_lac().unwrap(),
        Some(Bytes::from_static(b"lac"))
    );
}

#[test]
fn read_only_descriptors() {
    let (_dir, storage) = storage();
    assert!(matches!(
        LedgerDescriptor::create_read_only(5, Arc::clone(&storage)),
        Err(CoreError::NoLedger { ledger_id: 5 })
    ));

    let writer = LedgerDescriptor::create(b"k", 5, Arc::clone(&storage)).unwrap();
    writer.add_entry(entry(5, 0)).unwrap();

    let reader = LedgerDescriptor::create_read_only(5, storage).unwrap();
    assert!(reader.is_read_only());
    reader.check_access(b"k").unwrap();
    assert_eq!(reader.read_entry(0).unwrap(), entry(5, 0));
    assert!(matches!(
        reader.add_entry(entry(5, 1)),
        Err(CoreError::ReadOnly { ledger_id: 5 })
    ));
    assert!(matches!(reader.set_fenced(), Err(CoreError::ReadOnly { .. })));
    assert!(matches!(
        reader.fence_and_log_in_journal(None),
        Err(CoreError::ReadOnly { .. })
    ));
}

#[test]
fn fencing_rejects_new_entries() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"k", 6, Arc::clone(&storage)).unwrap();
    handle.add_entry(entry(6, 0)).unwrap();

    let journal = InMemoryJournal::new();
    let fenced = handle.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert_eq!(fenced.try_get().unwrap(), Some(Ok(())));
    assert_eq!(journal.records(), vec![(6, b"k".to_vec())]);

    assert!(handle.is_fenced().unwrap());
    assert!(matches!(
        handle.add_entry(entry(6, 1)),
        Err(CoreError::LedgerFenced { ledger_id: 6 })
    ));
    // Fencing is visible to every descriptor of the ledger.
    let other = LedgerDescriptor::new(b"k", 6, storage).unwrap();
    assert!(other.is_fenced().unwrap());
    assert!(!other.set_fenced().unwrap());

    // Already fenced and recorded: no journal needed, nothing new logged.
    let again = handle.fence_and_log_in_journal(None).unwrap();
    assert_eq!(again.try_get().unwrap(), Some(Ok(())));
    assert_eq!(journal.records().len(), 1);
}

#[test]
fn fencing_without_journal_changes_nothing() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"k", 7, storage).unwrap();

    assert!(matches!(
        handle.fence_and_log_in_journal(None),
        Err(CoreError::JournalUnavailable { ledger_id: 7 })
    ));
    assert!(!handle.is_fenced().unwrap());
    handle.add_entry(entry(7, 0)).unwrap();
}

#[test]
fn pending_fence_record_is_shared() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"k", 8, storage).unwrap();
    let journal = InMemoryJournal::deferred();

    let first = handle.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert!(!first.is_done());
    let second = handle.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert!(!second.is_done());
    assert_eq!(journal.records().len(), 1);

    assert_eq!(journal.release(), 1);
    assert_eq!(first.try_get().unwrap(), Some(Ok(())));
    assert_eq!(second.try_get().unwrap(), Some(Ok(())));
}

#[test]
fn failed_fence_record_is_retried() {
    let (_dir, storage) = storage();
    let handle = LedgerDescriptor::create(b"k", 9, storage).unwrap();
    let journal = InMemoryJournal::deferred();

    let first = handle.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert_eq!(journal.fail_pending("disk full"), 1);
    assert!(matches!(first.try_get().unwrap(), Some(Err(_))));
    assert!(handle.is_fenced().unwrap());

    // A retry has to log again, so it needs the journal.
    assert!(matches!(
        handle.fence_and_log_in_journal(None),
        Err(CoreError::JournalUnavailable { ledger_id: 9 })
    ));
    let retry = handle.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert_eq!(journal.records().len(), 2);
    assert_eq!(journal.release(), 1);
    assert_eq!(retry.wait().unwrap(), Ok(()));
}

#[test]
fn pending_fence_record_is_seen_by_other_descriptors() {
    let (_dir, storage) = storage();
    let fencer = LedgerDescriptor::create(b"k", 10, Arc::clone(&storage)).unwrap();
    let reader = LedgerDescriptor::new(b"k", 10, Arc::clone(&storage)).unwrap();
    let journal = InMemoryJournal::deferred();

    let logged = fencer.fence_and_log_in_journal(Some(&journal)).unwrap();
    let seen = reader.fence_and_log_in_journal(None).unwrap();
    assert!(!seen.is_done());
    assert_eq!(journal.records().len(), 1);

    assert_eq!(journal.release(), 1);
    assert_eq!(logged.try_get().unwrap(), Some(Ok(())));
    assert_eq!(seen.try_get().unwrap(), Some(Ok(())));

    let settled = reader.fence_and_log_in_journal(None).unwrap();
    assert!(settled.is_done());
    assert_eq!(journal.records().len(), 1);
}

#[test]
fn ledgers_fence_independently() {
    let (_dir, storage) = storage();
    let first = LedgerDescriptor::create(b"a", 11, Arc::clone(&storage)).unwrap();
    let second = LedgerDescriptor::create(b"b", 12, Arc::clone(&storage)).unwrap();
    let journal = InMemoryJournal::deferred();

    let first_fence = first.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert!(first.is_fenced().unwrap());
    assert!(!second.is_fenced().unwrap());
    second.add_entry(entry(12, 0)).unwrap();

    // The second ledger fences while the first record is still pending.
    let second_fence = second.fence_and_log_in_journal(Some(&journal)).unwrap();
    assert!(!first_fence.is_done());
    assert!(!second_fence.is_done());
    assert_eq!(
        journal.records(),
        vec![(11, b"a".to_vec()), (12, b"b".to_vec())]
    );

    assert_eq!(journal.release(), 2);
    assert_eq!(first_fence.wait().unwrap(), Ok(()));
    assert_eq!(second_fence.wait().unwrap(), Ok(()));
    assert!(first.is_fenced().unwrap());
    assert!(second.is_fenced().unwrap());
    assert!(matches!(
        first.add_entry(entry(11, 0)),
        Err(CoreError::LedgerFenced { ledger_id: 11 })
    ));
    assert!(matches!(
        second.add_entry(entry(12, 1)),
        Err(CoreError::LedgerFenced { ledger_id: 12 })
    ));
    assert_eq!(second.read_entry(0).unwrap(), entry(12, 0));
}
