//! Storage engine that writes entries straight to the entry log.

use super::{HighWaterMarks, LedgerStorage};
use crate::config::StorageConfig;
use crate::dirs::LedgerDirs;
use crate::entrylog::{EntryLogger, EntryLoggerConfig};
use crate::error::{CoreError, CoreResult};
use crate::gc::{GarbageCollector, GcStats, LedgerManager};
use crate::index::{IndexPage, LedgerMetadataIndex, PageEntriesSnapshot};
use crate::journal::FenceRecords;
use crate::kv::{KeyValueStorage, LogKeyValueStorage, WriteBatch};
use crate::types::{
    parse_entry_ids, parse_last_add_confirmed, validate_ledger_id, LogLocation, StorageStateFlag,
    LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

type LedgerPages = BTreeMap<i64, IndexPage>;

/// Ledger storage that appends every entry to the entry log as it arrives
/// and keeps a paged index of entry locations per ledger.
///
/// Entries of different ledgers end up interleaved in the logs. Index pages
/// live in memory; pages touched since the last flush are written to the
/// page store once the entry log is durable. Only the first configured
/// ledger directory is used.
pub struct InterleavedLedgerStorage {
    dirs: LedgerDirs,
    entries_per_page: usize,
    entry_logger: EntryLogger,
    ledgers: LedgerMetadataIndex,
    page_store: Box<dyn KeyValueStorage>,
    pages: RwLock<HashMap<i64, LedgerPages>>,
    dirty: Mutex<BTreeSet<(i64, i64)>>,
    high_water: HighWaterMarks,
    flush_lock: Mutex<()>,
    gc: GarbageCollector,
    fence_records: FenceRecords,
    shut_down: AtomicBool,
}

impl InterleavedLedgerStorage {
    /// Opens the engine over the first ledger directory.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the directory cannot be opened
    /// or an index cannot be replayed.
    pub fn open(config: &StorageConfig, ledger_manager: Arc<dyn LedgerManager>) -> CoreResult<Self> {
        config.validate()?;
        let ledger_root = &config.ledger_dirs[0];
        let index_root = config.index_dir_for(0).unwrap_or(ledger_root);
        let dirs = LedgerDirs::open(ledger_root, index_root, config.create_if_missing)?;

        let entry_logger =
            EntryLogger::open(dirs.ledger_dir().current(), EntryLoggerConfig::from(config))?;
        let ledgers = LedgerMetadataIndex::new(Box::new(LogKeyValueStorage::open_file(
            &dirs.index_dir().ledgers_path(),
            true,
        )?));
        let page_store: Box<dyn KeyValueStorage> = Box::new(LogKeyValueStorage::open_file(
            &dirs.index_dir().pages_path(),
            true,
        )?);

        let mut pages: HashMap<i64, LedgerPages> = HashMap::new();
        for (key, value) in page_store.range(&[], &[0xFF])? {
            let (ledger_id, first_entry) = decode_page_key(&key)?;
            pages
                .entry(ledger_id)
                .or_default()
                .insert(first_entry, decode_page(first_entry, &value)?);
        }
        info!(
            dir = %ledger_root.display(),
            ledgers = pages.len(),
            "opened interleaved ledger storage"
        );

        Ok(Self {
            dirs,
            entries_per_page: config.entries_per_page,
            entry_logger,
            ledgers,
            page_store,
            pages: RwLock::new(pages),
            dirty: Mutex::new(BTreeSet::new()),
            high_water: HighWaterMarks::default(),
            flush_lock: Mutex::new(()),
            gc: GarbageCollector::new(
                ledger_manager,
                config.minor_compaction_threshold,
                config.major_compaction_threshold,
            ),
            fence_records: FenceRecords::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }

    /// The directories of this engine.
    #[must_use]
    pub fn dirs(&self) -> &LedgerDirs {
        &self.dirs
    }

    /// The entry logger of this engine.
    #[must_use]
    pub fn get_entry_logger(&self) -> &EntryLogger {
        &self.entry_logger
    }

    /// The index pages of a ledger, in entry order. An unknown ledger has no
    /// pages.
    ///
    /// # Errors
    ///
    /// Fails for a negative ledger id or after shutdown.
    pub fn get_index_entries(&self, ledger_id: i64) -> CoreResult<PageEntriesSnapshot> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        let pages = self
            .pages
            .read()
            .get(&ledger_id)
            .map(|pages| pages.values().cloned().collect())
            .unwrap_or_default();
        Ok(PageEntriesSnapshot::new(ledger_id, pages))
    }

    /// Appends an entry to the log and indexes it.
    pub(crate) fn append(&self, ledger_id: i64, entry_id: i64, data: &[u8]) -> CoreResult<()> {
        let location = self.entry_logger.add_entry(ledger_id, data)?;
        self.record_location(ledger_id, entry_id, location);
        Ok(())
    }

    pub(crate) fn note_entry(&self, ledger_id: i64, entry_id: i64, lac: Option<i64>) {
        self.high_water.update(ledger_id, entry_id, lac);
    }

    fn record_location(&self, ledger_id: i64, entry_id: i64, location: LogLocation) {
        let mut pages = self.pages.write();
        let ledger_pages = pages.entry(ledger_id).or_default();
        let covering = ledger_pages
            .range_mut(..=entry_id)
            .next_back()
            .and_then(|(&first, page)| page.set(entry_id, location).then_some(first));
        let first = match covering {
            Some(first) => first,
            None => {
                let first = entry_id - entry_id % self.entries_per_page as i64;
                let mut page = IndexPage::new(first, self.entries_per_page);
                page.set(entry_id, location);
                ledger_pages.insert(first, page);
                first
            }
        };
        self.dirty.lock().insert((ledger_id, first));
    }

    fn get_location(&self, ledger_id: i64, entry_id: i64) -> Option<LogLocation> {
        self.pages
            .read()
            .get(&ledger_id)?
            .range(..=entry_id)
            .next_back()?
            .1
            .get(entry_id)
    }

    pub(crate) fn last_indexed_entry(&self, ledger_id: i64) -> Option<(i64, LogLocation)> {
        self.pages
            .read()
            .get(&ledger_id)?
            .values()
            .rev()
            .find_map(IndexPage::last_entry)
    }

    pub(crate) fn has_pages(&self, ledger_id: i64) -> bool {
        self.pages
            .read()
            .get(&ledger_id)
            .is_some_and(|pages| !pages.is_empty())
    }

    fn missing_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<CoreError> {
        if self.ledgers.get(ledger_id)?.is_some_and(|d| d.exists) || self.has_pages(ledger_id) {
            return Ok(CoreError::NoEntry {
                ledger_id,
                entry_id,
            });
        }
        Ok(CoreError::NoLedger { ledger_id })
    }

    fn flush_internal(&self) -> CoreResult<()> {
        let _guard = self.flush_lock.lock();
        let dirty = std::mem::take(&mut *self.dirty.lock());

        // Pages are captured before the log is flushed so that every slot
        // persisted below points at durable data.
        let snapshot: Vec<_> = {
            let pages = self.pages.read();
            dirty
                .iter()
                .map(|&(ledger_id, first)| {
                    let page = pages.get(&ledger_id).and_then(|p| p.get(&first)).cloned();
                    (ledger_id, first, page)
                })
                .collect()
        };

        let result = self.persist_pages(&snapshot);
        if result.is_err() {
            self.dirty.lock().extend(dirty);
        }
        result
    }

    fn persist_pages(&self, snapshot: &[(i64, i64, Option<IndexPage>)]) -> CoreResult<()> {
        self.entry_logger.flush()?;
        let mut batch = WriteBatch::new();
        for (ledger_id, first, page) in snapshot {
            if let Some(page) = page {
                batch.put(page_key(*ledger_id, *first), encode_page(page));
            }
        }
        if !batch.is_empty() {
            self.page_store.write(batch)?;
            self.page_store.sync()?;
            debug!(pages = snapshot.len(), "persisted index pages");
        }
        self.ledgers.sync()
    }

    fn delete_ledger_internal(&self, ledger_id: i64) -> CoreResult<()> {
        let _guard = self.flush_lock.lock();
        let removed = self.pages.write().remove(&ledger_id).unwrap_or_default();
        self.dirty.lock().retain(|&(l, _)| l != ledger_id);

        let mut batch = WriteBatch::new();
        for first in removed.keys() {
            batch.delete(page_key(ledger_id, *first));
        }
        if !batch.is_empty() {
            self.page_store.write(batch)?;
            self.page_store.sync()?;
        }
        self.ledgers.delete(ledger_id)?;
        self.ledgers.sync()?;
        self.high_water.remove(ledger_id);
        info!(ledger_id, pages = removed.len(), "deleted ledger");
        Ok(())
    }

    fn update_flag(&self, flag: StorageStateFlag, set: bool) -> CoreResult<()> {
        self.check_open()?;
        self.ledgers.update_storage_state_flag(flag, set)
    }
}

impl LedgerStorage for InterleavedLedgerStorage {
    fn start(&self) -> CoreResult<()> {
        self.check_open()
    }

    fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(CoreError::ShutDown);
        }
        let mut result = self.flush_internal();
        for closed in [
            self.entry_logger.close(),
            self.page_store.close(),
            self.ledgers.close(),
        ] {
            if let Err(e) = closed {
                result = result.and(Err(e));
            }
        }
        info!(dir = %self.dirs.ledger_dir().root().display(), "shut down interleaved ledger storage");
        result
    }

    fn ledger_exists(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(self.ledgers.get(ledger_id)?.is_some_and(|d| d.exists))
    }

    fn entry_exists(&self, ledger_id: i64, entry_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        if entry_id == LAST_ADD_CONFIRMED {
            return Ok(self.last_indexed_entry(ledger_id).is_some());
        }
        Ok(self.get_location(ledger_id, entry_id).is_some())
    }

    fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.ledgers.set_fenced(ledger_id)
    }

    fn fence_records(&self) -> &FenceRecords {
        &self.fence_records
    }

    fn is_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(self.ledgers.get_existing(ledger_id)?.fenced)
    }

    fn set_master_key(&self, ledger_id: i64, master_key: &[u8]) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.ledgers.set_master_key(ledger_id, master_key)
    }

    fn read_master_key(&self, ledger_id: i64) -> CoreResult<Vec<u8>> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(self.ledgers.existing(ledger_id)?.master_key)
    }

    fn add_entry(&self, entry: Bytes) -> CoreResult<i64> {
        self.check_open()?;
        let (ledger_id, entry_id) = parse_entry_ids(&entry)?;
        self.append(ledger_id, entry_id, &entry)?;
        self.note_entry(ledger_id, entry_id, parse_last_add_confirmed(&entry));
        Ok(entry_id)
    }

    fn get_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Bytes> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        if entry_id == LAST_ADD_CONFIRMED {
            return self.get_last_entry(ledger_id);
        }
        if entry_id < 0 {
            return Err(CoreError::InvalidEntryId {
                ledger_id,
                entry_id,
            });
        }
        match self.get_location(ledger_id, entry_id) {
            Some(location) => self.entry_logger.read_entry(ledger_id, entry_id, location),
            None => Err(self.missing_entry(ledger_id, entry_id)?),
        }
    }

    fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Bytes> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        match self.last_indexed_entry(ledger_id) {
            Some((entry_id, location)) => self.entry_logger.read_entry(ledger_id, entry_id, location),
            None => Err(self.missing_entry(ledger_id, LAST_ADD_CONFIRMED)?),
        }
    }

    fn get_last_add_confirmed(&self, ledger_id: i64) -> CoreResult<i64> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        if let Some(mark) = self.high_water.get(ledger_id) {
            return Ok(mark.last_add_confirmed);
        }
        let Some((entry_id, location)) = self.last_indexed_entry(ledger_id) else {
            self.ledgers.existing(ledger_id)?;
            return Ok(LAST_ADD_CONFIRMED);
        };
        let last = self.entry_logger.read_entry(ledger_id, entry_id, location)?;
        let lac = parse_last_add_confirmed(&last);
        self.note_entry(ledger_id, entry_id, lac);
        Ok(lac.unwrap_or(LAST_ADD_CONFIRMED))
    }

    fn flush(&self) -> CoreResult<()> {
        self.check_open()?;
        self.flush_internal()
    }

    fn delete_ledger(&self, ledger_id: i64) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.delete_ledger_internal(ledger_id)
    }

    fn get_active_ledgers_in_range(&self, first: i64, last: i64) -> CoreResult<Vec<i64>> {
        self.check_open()?;
        self.ledgers.active_ledgers_in_range(first, last)
    }

    fn set_explicit_lac(&self, ledger_id: i64, lac: Bytes) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.ledgers.set_explicit_lac(ledger_id, &lac)
    }

    fn get_explicit_lac(&self, ledger_id: i64) -> CoreResult<Option<Bytes>> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(self
            .ledgers
            .get_existing(ledger_id)?
            .explicit_lac
            .map(Bytes::from))
    }

    fn get_storage_state_flags(&self) -> CoreResult<BTreeSet<StorageStateFlag>> {
        self.check_open()?;
        self.ledgers.storage_state_flags()
    }

    fn set_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.update_flag(flag, true)
    }

    fn clear_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.update_flag(flag, false)
    }

    /// Deletes inactive ledgers. Entry logs are not compacted by this engine.
    fn force_gc(&self) -> CoreResult<GcStats> {
        self.check_open()?;
        let ledgers = self.ledgers.active_ledgers_in_range(0, i64::MAX)?;
        let mut stats = GcStats {
            major: true,
            ..GcStats::default()
        };
        for ledger_id in self.gc.inactive_ledgers(&ledgers)? {
            self.delete_ledger_internal(ledger_id)?;
            stats.ledgers_deleted += 1;
        }
        Ok(stats)
    }
}

impl fmt::Debug for InterleavedLedgerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterleavedLedgerStorage")
            .field("dir", &self.dirs.ledger_dir().root())
            .field("entries_per_page", &self.entries_per_page)
            .field("ledgers", &self.pages.read().len())
            .finish_non_exhaustive()
    }
}

fn page_key(ledger_id: i64, first_entry: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&ledger_id.to_be_bytes());
    key.extend_from_slice(&first_entry.to_be_bytes());
    key
}

fn decode_page_key(key: &[u8]) -> CoreResult<(i64, i64)> {
    let (Some(ledger), Some(first)) = (key.get(0..8), key.get(8..16)) else {
        return Err(CoreError::corruption(format!("bad page key of {} bytes", key.len())));
    };
    let ledger = i64::from_be_bytes(ledger.try_into().map_err(|_| CoreError::corruption("bad page key"))?);
    let first = i64::from_be_bytes(first.try_into().map_err(|_| CoreError::corruption("bad page key"))?);
    Ok((ledger, first))
}

fn encode_page(page: &IndexPage) -> Vec<u8> {
    page.slots().iter().flat_map(|slot| slot.to_be_bytes()).collect()
}

fn decode_page(first_entry: i64, value: &[u8]) -> CoreResult<IndexPage> {
    if value.len() % 8 != 0 {
        return Err(CoreError::corruption(format!(
            "index page at entry {first_entry} has {} bytes",
            value.len()
        )));
    }
    let slots = value
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            u64::from_be_bytes(bytes)
        })
        .collect();
    Ok(IndexPage::from_slots(first_entry, slots))
}
