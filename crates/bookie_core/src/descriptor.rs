//! Per-ledger handles used by the request-processing layer.

use crate::error::{CoreError, CoreResult};
use crate::journal::{FenceCompletion, Journal};
use crate::storage::LedgerStorage;
use crate::types::{parse_entry_ids, validate_ledger_id};
use bookie_storage::Completion;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// An open ledger: access control and fencing on top of [`LedgerStorage`].
///
/// Descriptors hold no ledger state of their own. Fencing, the master key,
/// the last-add-confirmed and fencing records in flight all live in the
/// storage, so every descriptor of a ledger sees the same values.
pub struct LedgerDescriptor {
    ledger_id: i64,
    master_key: Vec<u8>,
    storage: Arc<dyn LedgerStorage>,
    read_only: bool,
}

impl LedgerDescriptor {
    /// Opens a descriptor for a ledger whose master key is `master_key`.
    ///
    /// # Errors
    ///
    /// Fails for a negative ledger id.
    pub fn new(
        master_key: &[u8],
        ledger_id: i64,
        storage: Arc<dyn LedgerStorage>,
    ) -> CoreResult<Self> {
        validate_ledger_id(ledger_id)?;
        Ok(Self {
            ledger_id,
            master_key: master_key.to_vec(),
            storage,
            read_only: false,
        })
    }

    /// Registers the master key in storage and opens a descriptor.
    ///
    /// # Errors
    ///
    /// Fails with `MasterKeyMismatch` if the ledger exists with another key.
    pub fn create(
        master_key: &[u8],
        ledger_id: i64,
        storage: Arc<dyn LedgerStorage>,
    ) -> CoreResult<Self> {
        validate_ledger_id(ledger_id)?;
        storage.set_master_key(ledger_id, master_key)?;
        Self::new(master_key, ledger_id, storage)
    }

    /// Opens a read-only descriptor for an existing ledger.
    ///
    /// # Errors
    ///
    /// Fails with `NoLedger` if the ledger does not exist.
    pub fn create_read_only(ledger_id: i64, storage: Arc<dyn LedgerStorage>) -> CoreResult<Self> {
        validate_ledger_id(ledger_id)?;
        if !storage.ledger_exists(ledger_id)? {
            return Err(CoreError::NoLedger { ledger_id });
        }
        let master_key = storage.read_master_key(ledger_id)?;
        Ok(Self {
            read_only: true,
            ..Self::new(&master_key, ledger_id, storage)?
        })
    }

    /// The ledger this descriptor is for.
    #[must_use]
    pub fn ledger_id(&self) -> i64 {
        self.ledger_id
    }

    /// Whether the descriptor rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Checks a presented key against the master key. An empty key is a
    /// valid key of its own.
    ///
    /// # Errors
    ///
    /// Fails with `UnauthorizedAccess` if the keys differ.
    pub fn check_access(&self, master_key: &[u8]) -> CoreResult<()> {
        if self.master_key != master_key {
            return Err(CoreError::UnauthorizedAccess {
                ledger_id: self.ledger_id,
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::ReadOnly {
                ledger_id: self.ledger_id,
            });
        }
        Ok(())
    }

    /// Whether the ledger is fenced.
    ///
    /// # Errors
    ///
    /// See [`LedgerStorage::is_fenced`].
    pub fn is_fenced(&self) -> CoreResult<bool> {
        self.storage.is_fenced(self.ledger_id)
    }

    /// Fences the ledger. Returns whether the flag changed.
    ///
    /// # Errors
    ///
    /// Fails on read-only descriptors.
    pub fn set_fenced(&self) -> CoreResult<bool> {
        self.check_writable()?;
        self.storage.set_fenced(self.ledger_id)
    }

    /// Fences the ledger and logs a fencing record in the journal.
    ///
    /// The returned completion is done once the record is durable. A ledger
    /// that is already fenced, with no record in flight, yields a completed
    /// value and needs no journal. A failed record is logged again; one in
    /// flight is returned as is, whichever descriptor logged it.
    ///
    /// # Errors
    ///
    /// Fails with `JournalUnavailable`, before anything is changed, if a
    /// record must be logged and no journal is given.
    pub fn fence_and_log_in_journal(
        &self,
        journal: Option<&dyn Journal>,
    ) -> CoreResult<FenceCompletion> {
        self.check_writable()?;
        let slot = self.storage.fence_records().slot(self.ledger_id);
        let mut record = slot.lock();

        if !self.storage.is_fenced(self.ledger_id)? {
            let journal = journal.ok_or(CoreError::JournalUnavailable {
                ledger_id: self.ledger_id,
            })?;
            if self.storage.set_fenced(self.ledger_id)? {
                debug!(ledger_id = self.ledger_id, "logging fencing record");
                let completion = journal.log_fencing_record(self.ledger_id, &self.master_key);
                *record = Some(completion.clone());
                return Ok(completion);
            }
        }

        let retry = match record.as_ref() {
            None => false,
            Some(pending) => match pending.try_get() {
                Ok(None) => return Ok(pending.clone()),
                Ok(Some(Ok(()))) => false,
                Ok(Some(Err(_))) | Err(_) => true,
            },
        };
        if !retry {
            *record = None;
            return Ok(Completion::ready(Ok(())));
        }

        let journal = journal.ok_or(CoreError::JournalUnavailable {
            ledger_id: self.ledger_id,
        })?;
        debug!(ledger_id = self.ledger_id, "retrying failed fencing record");
        let completion = journal.log_fencing_record(self.ledger_id, &self.master_key);
        *record = Some(completion.clone());
        Ok(completion)
    }

    /// Stores an entry of this ledger.
    ///
    /// # Errors
    ///
    /// Fails on read-only descriptors, for entries of another ledger and
    /// when the ledger is fenced.
    pub fn add_entry(&self, entry: Bytes) -> CoreResult<i64> {
        self.check_writable()?;
        let (ledger_id, _) = parse_entry_ids(&entry)?;
        if ledger_id != self.ledger_id {
            return Err(CoreError::LedgerIdMismatch {
                expected: self.ledger_id,
                actual: ledger_id,
            });
        }
        if self.storage.is_fenced(ledger_id)? {
            return Err(CoreError::LedgerFenced { ledger_id });
        }
        self.storage.add_entry(entry)
    }

    /// Reads an entry. `LAST_ADD_CONFIRMED` reads the last entry.
    ///
    /// # Errors
    ///
    /// See [`LedgerStorage::get_entry`].
    pub fn read_entry(&self, entry_id: i64) -> CoreResult<Bytes> {
        self.storage.get_entry(self.ledger_id, entry_id)
    }

    /// The last-add-confirmed tracked by the storage.
    ///
    /// # Errors
    ///
    /// See [`LedgerStorage::get_last_add_confirmed`].
    pub fn get_last_add_confirmed(&self) -> CoreResult<i64> {
        self.storage.get_last_add_confirmed(self.ledger_id)
    }

    /// Stores an explicit LAC.
    ///
    /// # Errors
    ///
    /// Fails on read-only descriptors.
    pub fn set_explicit_lac(&self, lac: Bytes) -> CoreResult<()> {
        self.check_writable()?;
        self.storage.set_explicit_lac(self.ledger_id, lac)
    }

    /// The last explicit LAC stored.
    ///
    /// # Errors
    ///
    /// See [`LedgerStorage::get_explicit_lac`].
    pub fn get_explicit_lac(&self) -> CoreResult<Option<Bytes>> {
        self.storage.get_explicit_lac(self.ledger_id)
    }
}

impl fmt::Debug for LedgerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerDescriptor")
            .field("ledger_id", &self.ledger_id)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}
