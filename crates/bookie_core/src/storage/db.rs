//! Routing of ledgers over several ledger directories.

use super::{LedgerStorage, SingleDirectoryDbLedgerStorage};
use crate::config::StorageConfig;
use crate::dirs;
use crate::error::{CoreError, CoreResult};
use crate::gc::{GcStats, LedgerManager};
use crate::index::{EntryLocationIndex, PageEntriesIterable};
use crate::journal::FenceRecords;
use crate::kv::LogKeyValueStorage;
use crate::types::{validate_ledger_id, EntryLocation, StorageStateFlag};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Ledger storage over one [`SingleDirectoryDbLedgerStorage`] per ledger
/// directory.
///
/// A ledger always lives in directory `ledgerId mod N`, so the number of
/// ledger directories must not change while ledgers exist.
pub struct DbLedgerStorage {
    storages: Vec<Arc<SingleDirectoryDbLedgerStorage>>,
    fence_records: FenceRecords,
    shut_down: AtomicBool,
}

impl DbLedgerStorage {
    /// Opens one engine per configured ledger directory.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or any directory cannot be
    /// opened.
    pub fn open(config: &StorageConfig, ledger_manager: Arc<dyn LedgerManager>) -> CoreResult<Self> {
        config.validate()?;
        let mut storages = Vec::with_capacity(config.ledger_dirs.len());
        for (i, ledger_dir) in config.ledger_dirs.iter().enumerate() {
            let index_dir = config.index_dir_for(i).unwrap_or(ledger_dir);
            let storage = SingleDirectoryDbLedgerStorage::open(
                ledger_dir,
                index_dir,
                config,
                Arc::clone(&ledger_manager),
            );
            match storage {
                Ok(storage) => storages.push(storage),
                Err(e) => {
                    for opened in &storages {
                        let _ = opened.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        info!(dirs = storages.len(), "opened db ledger storage");
        Ok(Self {
            storages,
            fence_records: FenceRecords::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The per-directory engines, for maintenance tools.
    #[must_use]
    pub fn get_ledger_storage_list(&self) -> &[Arc<SingleDirectoryDbLedgerStorage>] {
        &self.storages
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }

    fn storage_for(&self, ledger_id: i64) -> CoreResult<&SingleDirectoryDbLedgerStorage> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(&self.storages[directory_index(ledger_id, self.storages.len())])
    }

    /// Adds a whole ledger to the index of its directory.
    ///
    /// # Errors
    ///
    /// See [`SingleDirectoryDbLedgerStorage::add_ledger_to_index`].
    pub fn add_ledger_to_index(
        &self,
        ledger_id: i64,
        is_fenced: bool,
        master_key: &[u8],
        pages: &dyn PageEntriesIterable,
    ) -> CoreResult<u64> {
        self.storage_for(ledger_id)?
            .add_ledger_to_index(ledger_id, is_fenced, master_key, pages)
    }

    /// Rewrites index entries in one atomic batch.
    ///
    /// Every location must belong to a ledger of the same directory; a batch
    /// is applied by a single index and never split.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::SplitLocationBatch`] if the ledgers live in
    /// different directories, and otherwise if a ledger id is invalid or the
    /// index cannot be written.
    pub fn update_entries_locations(&self, locations: &[EntryLocation]) -> CoreResult<()> {
        self.check_open()?;
        let mut touched = BTreeSet::new();
        for location in locations {
            validate_ledger_id(location.ledger_id)?;
            touched.insert(directory_index(location.ledger_id, self.storages.len()));
        }
        if touched.len() > 1 {
            return Err(CoreError::SplitLocationBatch {
                directories: touched.len(),
            });
        }
        match touched.first() {
            Some(&index) => self.storages[index].update_entries_locations(locations),
            None => Ok(()),
        }
    }

    /// Walks the persisted index of a ledger without opening the storage.
    ///
    /// `processor` is called with `(entryId, logId, offset)` for every entry
    /// in ascending entry order. Returns the number of entries visited.
    ///
    /// # Errors
    ///
    /// Fails if the index is missing or damaged, or the processor fails.
    pub fn read_ledger_index_entries<F>(
        ledger_id: i64,
        config: &StorageConfig,
        mut processor: F,
    ) -> CoreResult<usize>
    where
        F: FnMut(i64, u32, u32) -> CoreResult<()>,
    {
        validate_ledger_id(ledger_id)?;
        config.validate()?;
        let dir_index = directory_index(ledger_id, config.ledger_dirs.len());
        let index_root = config
            .index_dir_for(dir_index)
            .ok_or_else(|| CoreError::invalid_config("no index directory for ledger"))?;
        let path = dirs::locations_path(index_root);
        if !path.is_file() {
            return Err(CoreError::invalid_config(format!(
                "no location index at {}",
                path.display()
            )));
        }

        let index = EntryLocationIndex::new(Box::new(LogKeyValueStorage::open_file(&path, false)?));
        let entries = index.ledger_entries(ledger_id)?;
        for (entry_id, location) in &entries {
            processor(*entry_id, location.log_id(), location.offset())?;
        }
        index.close()?;
        Ok(entries.len())
    }
}

/// Directory owning a ledger.
fn directory_index(ledger_id: i64, dirs: usize) -> usize {
    (ledger_id.unsigned_abs() % dirs as u64) as usize
}

impl LedgerStorage for DbLedgerStorage {
    fn start(&self) -> CoreResult<()> {
        self.check_open()?;
        for storage in &self.storages {
            storage.start()?;
        }
        Ok(())
    }

    fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(CoreError::ShutDown);
        }
        let mut result = Ok(());
        for storage in &self.storages {
            if let Err(e) = storage.shutdown() {
                result = result.and(Err(e));
            }
        }
        info!("shut down db ledger storage");
        result
    }

    fn ledger_exists(&self, ledger_id: i64) -> CoreResult<bool> {
        self.storage_for(ledger_id)?.ledger_exists(ledger_id)
    }

    fn entry_exists(&self, ledger_id: i64, entry_id: i64) -> CoreResult<bool> {
        self.storage_for(ledger_id)?.entry_exists(ledger_id, entry_id)
    }

    fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        self.storage_for(ledger_id)?.set_fenced(ledger_id)
    }

    fn fence_records(&self) -> &FenceRecords {
        &self.fence_records
    }

    fn is_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        self.storage_for(ledger_id)?.is_fenced(ledger_id)
    }

    fn set_master_key(&self, ledger_id: i64, master_key: &[u8]) -> CoreResult<()> {
        self.storage_for(ledger_id)?
            .set_master_key(ledger_id, master_key)
    }

    fn read_master_key(&self, ledger_id: i64) -> CoreResult<Vec<u8>> {
        self.storage_for(ledger_id)?.read_master_key(ledger_id)
    }

    fn add_entry(&self, entry: Bytes) -> CoreResult<i64> {
        let (ledger_id, _) = crate::types::parse_entry_ids(&entry)?;
        self.storage_for(ledger_id)?.add_entry(entry)
    }

    fn get_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Bytes> {
        self.storage_for(ledger_id)?.get_entry(ledger_id, entry_id)
    }

    fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Bytes> {
        self.storage_for(ledger_id)?.get_last_entry(ledger_id)
    }

    fn get_last_add_confirmed(&self, ledger_id: i64) -> CoreResult<i64> {
        self.storage_for(ledger_id)?
            .get_last_add_confirmed(ledger_id)
    }

    fn flush(&self) -> CoreResult<()> {
        self.check_open()?;
        for storage in &self.storages {
            storage.flush()?;
        }
        Ok(())
    }

    fn delete_ledger(&self, ledger_id: i64) -> CoreResult<()> {
        self.storage_for(ledger_id)?.delete_ledger(ledger_id)
    }

    fn get_active_ledgers_in_range(&self, first: i64, last: i64) -> CoreResult<Vec<i64>> {
        self.check_open()?;
        let mut ledgers = Vec::new();
        for storage in &self.storages {
            ledgers.extend(storage.get_active_ledgers_in_range(first, last)?);
        }
        ledgers.sort_unstable();
        Ok(ledgers)
    }

    fn set_explicit_lac(&self, ledger_id: i64, lac: Bytes) -> CoreResult<()> {
        self.storage_for(ledger_id)?.set_explicit_lac(ledger_id, lac)
    }

    fn get_explicit_lac(&self, ledger_id: i64) -> CoreResult<Option<Bytes>> {
        self.storage_for(ledger_id)?.get_explicit_lac(ledger_id)
    }

    fn set_limbo_state(&self, ledger_id: i64) -> CoreResult<()> {
        self.storage_for(ledger_id)?.set_limbo_state(ledger_id)
    }

    fn clear_limbo_state(&self, ledger_id: i64) -> CoreResult<()> {
        self.storage_for(ledger_id)?.clear_limbo_state(ledger_id)
    }

    fn has_limbo_state(&self, ledger_id: i64) -> CoreResult<bool> {
        self.storage_for(ledger_id)?.has_limbo_state(ledger_id)
    }

    fn get_storage_state_flags(&self) -> CoreResult<BTreeSet<StorageStateFlag>> {
        self.check_open()?;
        let mut flags = BTreeSet::new();
        for storage in &self.storages {
            flags.extend(storage.get_storage_state_flags()?);
        }
        Ok(flags)
    }

    fn set_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.check_open()?;
        for storage in &self.storages {
            storage.set_storage_state_flag(flag)?;
        }
        Ok(())
    }

    fn clear_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.check_open()?;
        for storage in &self.storages {
            storage.clear_storage_state_flag(flag)?;
        }
        Ok(())
    }

    fn force_gc(&self) -> CoreResult<GcStats> {
        self.check_open()?;
        let mut stats = GcStats::default();
        for storage in &self.storages {
            stats.merge(&storage.force_gc()?);
        }
        Ok(stats)
    }
}

impl fmt::Debug for DbLedgerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbLedgerStorage")
            .field("storages", &self.storages)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}
