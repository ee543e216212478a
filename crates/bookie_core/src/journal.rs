//! The journal as seen by the storage engine.
//!
//! The engine only needs one thing from the journal: write a fencing record
//! for a ledger and report when it is durable.

use bookie_storage::{Completer, Completion};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a journal for a fencing record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("journal error: {message}")]
pub struct JournalError {
    /// Description of the failure.
    pub message: String,
}

impl JournalError {
    /// Creates a journal error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Completes once a fencing record is durable or has failed.
pub type FenceCompletion = Completion<Result<(), JournalError>>;

/// Records fencing of ledgers.
pub trait Journal: Send + Sync {
    /// Logs a fencing record for `ledger_id`.
    fn log_fencing_record(&self, ledger_id: i64, master_key: &[u8]) -> FenceCompletion;
}

/// Slot holding the last fencing record logged for one ledger.
pub type FenceSlot = Arc<Mutex<Option<FenceCompletion>>>;

/// Fencing records in flight, per ledger.
///
/// Owned by a storage engine so that every descriptor of a ledger sees the
/// same record. Slots nobody holds and that carry no record are dropped on
/// the next lookup.
#[derive(Default)]
pub struct FenceRecords {
    slots: Mutex<HashMap<i64, FenceSlot>>,
}

impl FenceRecords {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot of `ledger_id`, created on first use.
    pub fn slot(&self, ledger_id: i64) -> FenceSlot {
        let mut slots = self.slots.lock();
        slots.retain(|&id, slot| {
            id == ledger_id || Arc::strong_count(slot) > 1 || slot.lock().is_some()
        });
        Arc::clone(slots.entry(ledger_id).or_default())
    }

    /// Number of ledgers with a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no ledger has a slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl fmt::Debug for FenceRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceRecords")
            .field("ledgers", &self.len())
            .finish()
    }
}

/// A journal that keeps its records in memory.
///
/// In immediate mode every record completes as soon as it is logged. In
/// deferred mode records stay pending until [`InMemoryJournal::release`] or
/// [`InMemoryJournal::fail_pending`] is called.
pub struct InMemoryJournal {
    deferred: bool,
    state: Mutex<JournalState>,
}

#[derive(Default)]
struct JournalState {
    records: Vec<(i64, Vec<u8>)>,
    pending: Vec<Completer<Result<(), JournalError>>>,
}

impl InMemoryJournal {
    /// A journal whose records are durable immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deferred: false,
            state: Mutex::new(JournalState::default()),
        }
    }

    /// A journal whose records complete only when released.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            state: Mutex::new(JournalState::default()),
        }
    }

    /// Completes every pending record successfully. Returns how many were
    /// released.
    pub fn release(&self) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let released = pending.len();
        for completer in pending {
            completer.complete(Ok(()));
        }
        released
    }

    /// Fails every pending record.
    pub fn fail_pending(&self, message: &str) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let failed = pending.len();
        for completer in pending {
            completer.complete(Err(JournalError::new(message)));
        }
        failed
    }

    /// Every fencing record logged so far, as `(ledgerId, masterKey)`.
    #[must_use]
    pub fn records(&self) -> Vec<(i64, Vec<u8>)> {
        self.state.lock().records.clone()
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for InMemoryJournal {
    fn log_fencing_record(&self, ledger_id: i64, master_key: &[u8]) -> FenceCompletion {
        let mut state = self.state.lock();
        state.records.push((ledger_id, master_key.to_vec()));
        if !self.deferred {
            return Completion::ready(Ok(()));
        }
        let (completer, completion) = Completion::pair();
        state.pending.push(completer);
        completion
    }
}

impl fmt::Debug for InMemoryJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryJournal")
            .field("deferred", &self.deferred)
            .field("records", &state.records.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_slots_are_shared_and_pruned() {
        let records = FenceRecords::new();
        let first = records.slot(1);
        let again = records.slot(1);
        assert!(Arc::ptr_eq(&first, &again));

        *first.lock() = Some(Completion::ready(Ok(())));
        drop((first, again));
        let _other = records.slot(2);
        assert_eq!(records.len(), 2);

        *records.slot(1).lock() = None;
        let _third = records.slot(3);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn immediate_journal_completes() {
        let journal = InMemoryJournal::new();
        let done = journal.log_fencing_record(3, b"key");
        assert!(done.is_done());
        assert_eq!(done.wait().unwrap(), Ok(()));
        assert_eq!(journal.records(), vec![(3, b"key".to_vec())]);
    }

    #[test]
    fn deferred_journal_waits_for_release() {
        let journal = InMemoryJournal::deferred();
        let first = journal.log_fencing_record(1, b"");
        let second = journal.log_fencing_record(2, b"");
        assert!(!first.is_done());
        assert!(!first.is_done());

        assert_eq!(journal.release(), 2);
        assert_eq!(first.wait().unwrap(), Ok(()));
        assert_eq!(second.try_get().unwrap(), Some(Ok(())));
    }

    #[test]
    fn failed_records_report_the_error() {
        let journal = InMemoryJournal::deferred();
        let done = journal.log_fencing_record(1, b"");
        journal.fail_pending("disk full");
        let err = done.wait().unwrap().unwrap_err();
        assert_eq!(err.message, "disk full");
    }
}
