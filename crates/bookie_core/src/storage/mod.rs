//! Ledger storage engines.
//!
//! [`LedgerStorage`] is the contract between the request-processing layer
//! and the engines:
//!
//! - [`DbLedgerStorage`] - routes ledgers over one
//!   [`SingleDirectoryDbLedgerStorage`] per ledger directory (write cache,
//!   read cache, entry logs, key-value location index)
//! - [`InterleavedLedgerStorage`] - entries go straight to the entry log,
//!   locations to a paged per-ledger index
//! - [`SortedLedgerStorage`] - the interleaved engine behind a memtable that
//!   writes entries in `(ledgerId, entryId)` order
//!
//! [`open_ledger_storage`] picks the engine named by
//! [`StorageConfig::storage_kind`].

mod db;
mod interleaved;
mod single_dir;
mod sorted;

pub use db::DbLedgerStorage;
pub use interleaved::InterleavedLedgerStorage;
pub use single_dir::SingleDirectoryDbLedgerStorage;
pub use sorted::SortedLedgerStorage;

use crate::config::{LedgerStorageKind, StorageConfig};
use crate::error::{CoreError, CoreResult};
use crate::gc::{AllLedgersActive, GcStats, LedgerManager};
use crate::journal::FenceRecords;
use crate::types::StorageStateFlag;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Storage of ledger entries and metadata.
///
/// All ledger ids must be non-negative; negative ids fail with
/// [`CoreError::InvalidLedgerId`] before anything else is looked at.
pub trait LedgerStorage: Send + Sync {
    /// Starts background work (periodic garbage collection).
    fn start(&self) -> CoreResult<()>;

    /// Stops background work, flushes and releases files. Every later
    /// operation fails with [`CoreError::ShutDown`].
    fn shutdown(&self) -> CoreResult<()>;

    /// Whether the ledger has metadata.
    fn ledger_exists(&self, ledger_id: i64) -> CoreResult<bool>;

    /// Whether the entry is stored. `LAST_ADD_CONFIRMED` asks whether the
    /// ledger has any entry.
    fn entry_exists(&self, ledger_id: i64, entry_id: i64) -> CoreResult<bool>;

    /// Fences the ledger. Returns whether the flag changed.
    fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool>;

    /// Whether the ledger is fenced.
    fn is_fenced(&self, ledger_id: i64) -> CoreResult<bool>;

    /// Fencing records in flight for the ledgers of this storage.
    fn fence_records(&self) -> &FenceRecords;

    /// Registers the master key, creating the ledger if needed.
    fn set_master_key(&self, ledger_id: i64, master_key: &[u8]) -> CoreResult<()>;

    /// The master key of the ledger.
    fn read_master_key(&self, ledger_id: i64) -> CoreResult<Vec<u8>>;

    /// Stores an entry and returns its entry id.
    fn add_entry(&self, entry: Bytes) -> CoreResult<i64>;

    /// Reads an entry. `LAST_ADD_CONFIRMED` reads the last entry.
    fn get_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Bytes>;

    /// Reads the entry with the highest id.
    fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Bytes>;

    /// Highest last-add-confirmed seen for the ledger.
    fn get_last_add_confirmed(&self, ledger_id: i64) -> CoreResult<i64>;

    /// Makes every entry added so far durable and indexed.
    fn flush(&self) -> CoreResult<()>;

    /// Removes the ledger's metadata and index entries.
    fn delete_ledger(&self, ledger_id: i64) -> CoreResult<()>;

    /// Existing ledgers with `first <= id < last`, ascending.
    fn get_active_ledgers_in_range(&self, first: i64, last: i64) -> CoreResult<Vec<i64>>;

    /// Stores an explicit LAC for the ledger.
    fn set_explicit_lac(&self, ledger_id: i64, lac: Bytes) -> CoreResult<()>;

    /// The last explicit LAC stored for the ledger.
    fn get_explicit_lac(&self, ledger_id: i64) -> CoreResult<Option<Bytes>>;

    /// Puts the ledger in limbo.
    fn set_limbo_state(&self, _ledger_id: i64) -> CoreResult<()> {
        Err(CoreError::Unsupported {
            operation: "set_limbo_state",
        })
    }

    /// Takes the ledger out of limbo.
    fn clear_limbo_state(&self, _ledger_id: i64) -> CoreResult<()> {
        Err(CoreError::Unsupported {
            operation: "clear_limbo_state",
        })
    }

    /// Whether the ledger is in limbo.
    fn has_limbo_state(&self, _ledger_id: i64) -> CoreResult<bool> {
        Err(CoreError::Unsupported {
            operation: "has_limbo_state",
        })
    }

    /// Persistent storage state flags.
    fn get_storage_state_flags(&self) -> CoreResult<BTreeSet<StorageStateFlag>>;

    /// Sets a storage state flag.
    fn set_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()>;

    /// Clears a storage state flag.
    fn clear_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()>;

    /// Runs a major garbage collection now.
    fn force_gc(&self) -> CoreResult<GcStats>;
}

/// Opens the engine named by the configuration. Every ledger is treated as
/// active by garbage collection.
///
/// # Errors
///
/// Fails if the configuration is invalid or a directory cannot be opened.
pub fn open_ledger_storage(config: &StorageConfig) -> CoreResult<Arc<dyn LedgerStorage>> {
    open_ledger_storage_with(config, Arc::new(AllLedgersActive))
}

/// Opens the engine named by the configuration, asking `ledger_manager`
/// which ledgers garbage collection may delete.
///
/// # Errors
///
/// Fails if the configuration is invalid or a directory cannot be opened.
pub fn open_ledger_storage_with(
    config: &StorageConfig,
    ledger_manager: Arc<dyn LedgerManager>,
) -> CoreResult<Arc<dyn LedgerStorage>> {
    Ok(match config.storage_kind {
        LedgerStorageKind::Db => Arc::new(DbLedgerStorage::open(config, ledger_manager)?),
        LedgerStorageKind::Interleaved => {
            Arc::new(InterleavedLedgerStorage::open(config, ledger_manager)?)
        }
        LedgerStorageKind::Sorted => Arc::new(SortedLedgerStorage::open(config, ledger_manager)?),
    })
}

/// Per-ledger high-water marks kept in memory.
#[derive(Debug, Default)]
pub(crate) struct HighWaterMarks {
    marks: parking_lot::RwLock<HashMap<i64, HighWater>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HighWater {
    pub(crate) last_entry: i64,
    pub(crate) last_add_confirmed: i64,
}

impl HighWaterMarks {
    /// Raises the marks of a ledger; they never go down.
    pub(crate) fn update(&self, ledger_id: i64, entry_id: i64, lac: Option<i64>) {
        let lac = lac.unwrap_or(crate::types::LAST_ADD_CONFIRMED);
        let mut marks = self.marks.write();
        let mark = marks.entry(ledger_id).or_insert(HighWater {
            last_entry: entry_id,
            last_add_confirmed: lac,
        });
        mark.last_entry = mark.last_entry.max(entry_id);
        mark.last_add_confirmed = mark.last_add_confirmed.max(lac);
    }

    pub(crate) fn get(&self, ledger_id: i64) -> Option<HighWater> {
        self.marks.read().get(&ledger_id).copied()
    }

    pub(crate) fn remove(&self, ledger_id: i64) {
        self.marks.write().remove(&ledger_id);
    }
}
