//! Storage engine for one ledger directory.

use super::{HighWaterMarks, LedgerStorage};
use crate::cache::{Generation, ReadCache, WriteCache};
use crate::config::StorageConfig;
use crate::dirs::LedgerDirs;
use crate::entrylog::{EntryLogger, EntryLoggerConfig};
use crate::error::{CoreError, CoreResult};
use crate::gc::{GarbageCollector, GcStats, LedgerManager};
use crate::index::{
    EntryLocationIndex, LedgerData, LedgerMetadataIndex, PageEntriesIterable,
};
use crate::journal::FenceRecords;
use crate::kv::LogKeyValueStorage;
use crate::types::{
    parse_entry_ids, parse_last_add_confirmed, validate_ledger_id, EntryLocation, LogLocation,
    StorageStateFlag, LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ledger storage over one ledger directory.
///
/// Entries are first added to a [`WriteCache`]. A flush swaps the cache
/// generations, appends the drained entries to the [`EntryLogger`] in
/// `(ledgerId, entryId)` order, makes the log durable and then records every
/// location in the [`EntryLocationIndex`] in a single batch. Reads look at the
/// write cache, then the read cache, then the index.
///
/// A maintenance thread per engine flushes the write cache when writers find
/// it full and, once [`LedgerStorage::start`] was called, runs garbage
/// collection every `gc_wait_time`.
pub struct SingleDirectoryDbLedgerStorage {
    dirs: LedgerDirs,
    config: StorageConfig,
    entry_logger: EntryLogger,
    locations: EntryLocationIndex,
    ledgers: LedgerMetadataIndex,
    write_cache: WriteCache,
    read_cache: ReadCache,
    high_water: HighWaterMarks,
    /// Serializes flushes with compaction and ledger deletion.
    flush_lock: Mutex<()>,
    /// Bumped after every flush; throttled writers wait on it.
    flush_epoch: Mutex<u64>,
    flushed: Condvar,
    gc: GarbageCollector,
    maintenance: Arc<Maintenance>,
    maintenance_thread: Mutex<Option<JoinHandle<()>>>,
    fence_records: FenceRecords,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct Maintenance {
    state: Mutex<MaintenanceState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct MaintenanceState {
    flush_requested: bool,
    gc_interval: Option<Duration>,
    stop: bool,
}

enum MaintenanceTask {
    Flush,
    Gc,
}

impl SingleDirectoryDbLedgerStorage {
    /// Opens the engine for one ledger directory and its index directory.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, a directory cannot be opened
    /// or locked, or an index cannot be replayed.
    pub fn open(
        ledger_root: &Path,
        index_root: &Path,
        config: &StorageConfig,
        ledger_manager: Arc<dyn LedgerManager>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let dirs = LedgerDirs::open(ledger_root, index_root, config.create_if_missing)?;
        let entry_logger =
            EntryLogger::open(dirs.ledger_dir().current(), EntryLoggerConfig::from(config))?;
        let locations = EntryLocationIndex::new(Box::new(LogKeyValueStorage::open_file(
            &dirs.index_dir().locations_path(),
            true,
        )?));
        let ledgers = LedgerMetadataIndex::new(Box::new(LogKeyValueStorage::open_file(
            &dirs.index_dir().ledgers_path(),
            true,
        )?));

        let storage = Arc::new(Self {
            dirs,
            config: config.clone(),
            entry_logger,
            locations,
            ledgers,
            write_cache: WriteCache::new(config.write_cache_max_size),
            read_cache: ReadCache::new(config.read_cache_max_size),
            high_water: HighWaterMarks::default(),
            flush_lock: Mutex::new(()),
            flush_epoch: Mutex::new(0),
            flushed: Condvar::new(),
            gc: GarbageCollector::new(
                ledger_manager,
                config.minor_compaction_threshold,
                config.major_compaction_threshold,
            ),
            maintenance: Arc::new(Maintenance::default()),
            maintenance_thread: Mutex::new(None),
            fence_records: FenceRecords::new(),
            shut_down: AtomicBool::new(false),
        });

        let shared = Arc::clone(&storage.maintenance);
        let engine = Arc::downgrade(&storage);
        let every = config.major_compaction_every;
        let handle = thread::Builder::new()
            .name("bookie-db-maintenance".into())
            .spawn(move || maintenance_loop(&shared, &engine, every))?;
        *storage.maintenance_thread.lock() = Some(handle);

        info!(
            ledger_dir = %ledger_root.display(),
            index_dir = %index_root.display(),
            ledgers = storage.ledgers.count(),
            entries = storage.locations.count(),
            "opened ledger storage directory"
        );
        Ok(storage)
    }

    fn check_open(&self) -> CoreResult<()> {
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

    pub(crate) fn entry_logger(&self) -> &EntryLogger {
        &self.entry_logger
    }

    pub(crate) fn location_index(&self) -> &EntryLocationIndex {
        &self.locations
    }

    pub(crate) fn ledger_index(&self) -> &LedgerMetadataIndex {
        &self.ledgers
    }

    pub(crate) fn flush_lock(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// Entries waiting in the write cache.
    #[must_use]
    pub fn write_cache_count(&self) -> usize {
        self.write_cache.count()
    }

    // ---- writes ----

    fn add_entry_internal(&self, entry: Bytes) -> CoreResult<i64> {
        self.check_open()?;
        let (ledger_id, entry_id) = parse_entry_ids(&entry)?;
        let lac = parse_last_add_confirmed(&entry);

        if !self.write_cache.put(ledger_id, entry_id, entry.clone()) {
            self.wait_for_room(ledger_id, entry_id, entry)?;
        }
        self.high_water.update(ledger_id, entry_id, lac);
        Ok(entry_id)
    }

    /// Asks for a flush and retries the insert until the throttle time runs
    /// out.
    fn wait_for_room(&self, ledger_id: i64, entry_id: i64, entry: Bytes) -> CoreResult<()> {
        let deadline = Instant::now() + self.config.max_throttle_time;
        loop {
            let epoch = *self.flush_epoch.lock();
            self.request_flush();
            {
                let mut current = self.flush_epoch.lock();
                while *current == epoch && !self.shut_down.load(Ordering::Acquire) {
                    if self.flushed.wait_until(&mut current, deadline).timed_out() {
                        break;
                    }
                }
            }
            self.check_open()?;
            if self.write_cache.put(ledger_id, entry_id, entry.clone()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(ledger_id, entry_id, "write cache full, rejecting entry");
                return Err(CoreError::operation_rejected(format!(
                    "write cache stayed full for {:?}",
                    self.config.max_throttle_time
                )));
            }
        }
    }

    fn request_flush(&self) {
        let mut state = self.maintenance.state.lock();
        state.flush_requested = true;
        self.maintenance.wakeup.notify_all();
    }

    pub(crate) fn flush_internal(&self) -> CoreResult<()> {
        let result = self.flush_locked(&self.flush_lock.lock());
        let mut epoch = self.flush_epoch.lock();
        *epoch += 1;
        self.flushed.notify_all();
        result
    }

    fn flush_locked(&self, _guard: &MutexGuard<'_, ()>) -> CoreResult<()> {
        // A generation left over by a failed flush goes first.
        if let Some(leftover) = self.write_cache.flushing() {
            self.write_generation(&leftover)?;
            self.write_cache.clear_flushing();
        }
        if let Some(generation) = self.write_cache.swap() {
            self.write_generation(&generation)?;
            self.write_cache.clear_flushing();
        }
        self.ledgers.sync()
    }

    fn write_generation(&self, generation: &Generation) -> CoreResult<()> {
        let started = Instant::now();
        let mut locations = Vec::with_capacity(generation.len());
        for (ledger_id, entry_id, data) in generation.iter() {
            let location = self.entry_logger.add_entry(ledger_id, data)?;
            locations.push(EntryLocation::new(ledger_id, entry_id, location));
        }
        self.entry_logger.flush()?;
        self.locations.add_locations(&locations)?;
        self.locations.sync()?;
        debug!(
            entries = locations.len(),
            bytes = generation.size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "flushed write cache"
        );
        Ok(())
    }

    /// Rewrites index entries. Readers see either every old or every new
    /// location.
    ///
    /// # Errors
    ///
    /// Fails if the index cannot be written.
    pub fn update_entries_locations(&self, locations: &[EntryLocation]) -> CoreResult<()> {
        self.check_open()?;
        let _guard = self.flush_lock.lock();
        self.apply_locations(locations)
    }

    /// Applies relocations. The caller holds the flush lock.
    pub(crate) fn apply_locations(&self, locations: &[EntryLocation]) -> CoreResult<()> {
        if locations.is_empty() {
            return Ok(());
        }
        self.locations.add_locations(locations)?;
        self.locations.sync()?;
        for location in locations {
            self.read_cache
                .invalidate(location.ledger_id, location.entry_id);
        }
        Ok(())
    }

    /// Adds a whole ledger to the index from pages of entry locations.
    ///
    /// Every page is materialized before anything is written. Returns the
    /// number of entries indexed.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::EmptyPages`] if the source yields no page and
    /// [`CoreError::PageMaterialization`] if producing a page fails.
    pub fn add_ledger_to_index(
        &self,
        ledger_id: i64,
        is_fenced: bool,
        master_key: &[u8],
        pages: &dyn PageEntriesIterable,
    ) -> CoreResult<u64> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        if pages.ledger_id() != ledger_id {
            return Err(CoreError::LedgerIdMismatch {
                expected: ledger_id,
                actual: pages.ledger_id(),
            });
        }

        let mut locations = Vec::new();
        let mut page_count = 0usize;
        for page in pages.pages() {
            let page = page.map_err(|e| CoreError::PageMaterialization {
                ledger_id,
                message: e.to_string(),
            })?;
            page_count += 1;
            locations.extend(
                page.entries()
                    .map(|(entry_id, location)| EntryLocation::new(ledger_id, entry_id, location)),
            );
        }
        if page_count == 0 {
            return Err(CoreError::EmptyPages { ledger_id });
        }

        let _guard = self.flush_lock.lock();
        // Locations are synced before the ledger record is written.
        self.locations.add_locations(&locations)?;
        self.locations.sync()?;
        self.ledgers.modify(ledger_id, |data| {
            let data = data.get_or_insert_with(LedgerData::default);
            data.exists = true;
            data.fenced = is_fenced;
            data.master_key = master_key.to_vec();
            Ok(())
        })?;
        self.ledgers.sync()?;
        self.read_cache.invalidate_ledger(ledger_id);

        info!(ledger_id, pages = page_count, entries = locations.len(), "added ledger to index");
        Ok(locations.len() as u64)
    }

    pub(crate) fn delete_ledger_internal(&self, ledger_id: i64) -> CoreResult<()> {
        let _guard = self.flush_lock.lock();
        let cached = self.write_cache.delete_ledger(ledger_id);
        let indexed = self.locations.delete_ledger(ledger_id)?;
        self.locations.sync()?;
        self.ledgers.delete(ledger_id)?;
        self.ledgers.sync()?;
        self.read_cache.invalidate_ledger(ledger_id);
        self.high_water.remove(ledger_id);
        info!(ledger_id, cached, indexed, "deleted ledger");
        Ok(())
    }

    // ---- reads ----

    /// Reads an entry without resolving the last-add-confirmed sentinel.
    fn do_get_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Bytes> {
        if let Some(data) = self.write_cache.get(ledger_id, entry_id) {
            return Ok(data);
        }
        if let Some(data) = self.read_cache.get(ledger_id, entry_id) {
            return Ok(data);
        }
        let Some(location) = self.locations.get_location(ledger_id, entry_id)? else {
            return Err(self.missing_entry(ledger_id, entry_id)?);
        };
        let data = self.entry_logger.read_entry(ledger_id, entry_id, location)?;
        self.read_cache.put(ledger_id, entry_id, data.clone());
        self.read_ahead(ledger_id, entry_id, location);
        Ok(data)
    }

    /// Loads the entries following a cache miss that live in the same log.
    fn read_ahead(&self, ledger_id: i64, entry_id: i64, location: LogLocation) {
        let mut next = entry_id;
        for _ in 0..self.config.read_ahead_batch_size {
            next += 1;
            if self.read_cache.get(ledger_id, next).is_some() {
                continue;
            }
            let found = match self.locations.get_location(ledger_id, next) {
                Ok(Some(found)) if found.log_id() == location.log_id() => found,
                Ok(_) => break,
                Err(e) => {
                    debug!(ledger_id, entry_id = next, error = %e, "read-ahead stopped");
                    break;
                }
            };
            match self.entry_logger.read_entry(ledger_id, next, found) {
                Ok(data) => self.read_cache.put(ledger_id, next, data),
                Err(e) => {
                    debug!(ledger_id, entry_id = next, error = %e, "read-ahead stopped");
                    break;
                }
            }
        }
    }

    /// The error for an entry that is neither cached nor indexed.
    fn missing_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<CoreError> {
        let data = self.ledgers.get(ledger_id)?;
        if data.as_ref().is_some_and(|d| d.limbo) {
            return Ok(CoreError::DataUnknown { ledger_id });
        }
        if data.is_some_and(|d| d.exists) || self.has_entries(ledger_id)? {
            return Ok(CoreError::NoEntry {
                ledger_id,
                entry_id,
            });
        }
        Ok(CoreError::NoLedger { ledger_id })
    }

    fn has_entries(&self, ledger_id: i64) -> CoreResult<bool> {
        Ok(self.write_cache.has_entries(ledger_id)
            || self.locations.get_last_entry(ledger_id)?.is_some())
    }

    fn last_entry_id(&self, ledger_id: i64) -> CoreResult<Option<i64>> {
        let cached = self.write_cache.last_entry(ledger_id).map(|(e, _)| e);
        let indexed = self.locations.get_last_entry(ledger_id)?.map(|(e, _)| e);
        Ok(cached.max(indexed))
    }

    fn update_flag(&self, flag: StorageStateFlag, set: bool) -> CoreResult<()> {
        self.check_open()?;
        self.ledgers.update_storage_state_flag(flag, set)
    }

    fn stop_maintenance(&self) {
        {
            let mut state = self.maintenance.state.lock();
            state.stop = true;
            self.maintenance.wakeup.notify_all();
        }
        let handle = self.maintenance_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }

    /// Runs one garbage collection.
    ///
    /// # Errors
    ///
    /// Fails if the storage is shut down or a log cannot be compacted.
    pub fn run_gc(&self, major: bool) -> CoreResult<GcStats> {
        self.check_open()?;
        self.gc.run(self, major)
    }
}

impl LedgerStorage for SingleDirectoryDbLedgerStorage {
    fn start(&self) -> CoreResult<()> {
        self.check_open()?;
        if !self.config.gc_wait_time.is_zero() {
            let mut state = self.maintenance.state.lock();
            state.gc_interval = Some(self.config.gc_wait_time);
            self.maintenance.wakeup.notify_all();
        }
        Ok(())
    }

    fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_maintenance();

        let mut result = self.flush_internal();
        for closed in [
            self.entry_logger.close(),
            self.locations.close(),
            self.ledgers.close(),
        ] {
            if let Err(e) = closed {
                result = result.and(Err(e));
            }
        }
        info!(dir = %self.dirs.ledger_dir().root().display(), "shut down ledger storage directory");
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
            return self.has_entries(ledger_id);
        }
        Ok(self.write_cache.get(ledger_id, entry_id).is_some()
            || self.locations.get_location(ledger_id, entry_id)?.is_some())
    }

    fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        let changed = self.ledgers.set_fenced(ledger_id)?;
        if changed {
            debug!(ledger_id, "fenced ledger");
        }
        Ok(changed)
    }

    fn fence_records(&self) -> &FenceRecords {
        &self.fence_records
    }

    fn is_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        let data = self.ledgers.get_existing(ledger_id)?;
        if data.limbo && !self.has_entries(ledger_id)? {
            return Err(CoreError::DataUnknown { ledger_id });
        }
        Ok(data.fenced)
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
        self.add_entry_internal(entry)
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
        self.do_get_entry(ledger_id, entry_id)
    }

    fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Bytes> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        let cached = self.write_cache.last_entry(ledger_id);
        let indexed = self.locations.get_last_entry(ledger_id)?;
        match (cached, indexed) {
            (Some((cached_id, data)), Some((indexed_id, _))) if cached_id >= indexed_id => Ok(data),
            (Some((_, data)), None) => Ok(data),
            (_, Some((indexed_id, _))) => self.do_get_entry(ledger_id, indexed_id),
            (None, None) => Err(self.missing_entry(ledger_id, LAST_ADD_CONFIRMED)?),
        }
    }

    fn get_last_add_confirmed(&self, ledger_id: i64) -> CoreResult<i64> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        if let Some(mark) = self.high_water.get(ledger_id) {
            return Ok(mark.last_add_confirmed);
        }

        // Nothing added since open: recover the mark from the last entry.
        let Some(last_entry_id) = self.last_entry_id(ledger_id)? else {
            self.ledgers.existing(ledger_id)?;
            return Ok(LAST_ADD_CONFIRMED);
        };
        let last = self.do_get_entry(ledger_id, last_entry_id)?;
        let lac = parse_last_add_confirmed(&last);
        self.high_water.update(ledger_id, last_entry_id, lac);
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

    fn set_limbo_state(&self, ledger_id: i64) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.ledgers.modify(ledger_id, |data| {
            data.get_or_insert_with(LedgerData::default).limbo = true;
            Ok(())
        })?;
        self.ledgers.sync()
    }

    fn clear_limbo_state(&self, ledger_id: i64) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        self.ledgers.modify(ledger_id, |data| {
            if let Some(existing) = data.as_mut() {
                existing.limbo = false;
                // A record that only ever held limbo state goes away with it.
                if *existing == LedgerData::default() {
                    *data = None;
                }
            }
            Ok(())
        })?;
        self.ledgers.sync()
    }

    fn has_limbo_state(&self, ledger_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.check_open()?;
        Ok(self.ledgers.get_existing(ledger_id)?.limbo)
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

    fn force_gc(&self) -> CoreResult<GcStats> {
        self.run_gc(true)
    }
}

impl Drop for SingleDirectoryDbLedgerStorage {
    fn drop(&mut self) {
        let mut state = self.maintenance.state.lock();
        state.stop = true;
        self.maintenance.wakeup.notify_all();
    }
}

impl fmt::Debug for SingleDirectoryDbLedgerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleDirectoryDbLedgerStorage")
            .field("dir", &self.dirs.ledger_dir().root())
            .field("write_cache", &self.write_cache)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Waits for flush requests and GC ticks. The engine is only borrowed while
/// a task runs, so dropping the last handle stops the loop.
fn maintenance_loop(
    shared: &Maintenance,
    engine: &Weak<SingleDirectoryDbLedgerStorage>,
    major_every: u32,
) {
    let mut gc_runs: u32 = 0;
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.stop {
                    return;
                }
                if state.flush_requested {
                    state.flush_requested = false;
                    break MaintenanceTask::Flush;
                }
                match state.gc_interval {
                    Some(interval) => {
                        if shared.wakeup.wait_for(&mut state, interval).timed_out() && !state.stop {
                            break MaintenanceTask::Gc;
                        }
                    }
                    None => shared.wakeup.wait(&mut state),
                }
            }
        };

        let Some(engine) = engine.upgrade() else {
            return;
        };
        match task {
            MaintenanceTask::Flush => {
                if let Err(e) = engine.flush_internal() {
                    warn!(error = %e, "background flush failed");
                }
            }
            MaintenanceTask::Gc => {
                gc_runs = gc_runs.wrapping_add(1);
                let major = major_every > 0 && gc_runs % major_every == 0;
                if let Err(e) = engine.run_gc(major) {
                    warn!(error = %e, major, "garbage collection failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::AllLedgersActive;
    use crate::index::{IndexPage, PageEntriesSnapshot};
    use tempfile::{tempdir, TempDir};

    fn entry(ledger_id: i64, entry_id: i64, body: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(24 + body.len());
        buf.extend_from_slice(&ledger_id.to_be_bytes());
        buf.extend_from_slice(&entry_id.to_be_bytes());
        buf.extend_from_slice(&(entry_id - 1).to_be_bytes());
        buf.extend_from_slice(body);
        Bytes::from(buf)
    }

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig::new()
            .ledger_dir(dir.path().join("ledgers"))
            .entry_log_max_size(64 * 1024)
            .write_buffer_size(4096)
            .buffer_pool_size(4)
            .max_throttle_time(Duration::from_secs(5))
    }

    fn open(config: &StorageConfig) -> Arc<SingleDirectoryDbLedgerStorage> {
        let root = &config.ledger_dirs[0];
        SingleDirectoryDbLedgerStorage::open(root, root, config, Arc::new(AllLedgersActive))
            .unwrap()
    }

    #[test]
    fn add_flush_and_read() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.set_master_key(1, b"key").unwrap();

        for e in 0..10 {
            assert_eq!(storage.add_entry(entry(1, e, b"payload")).unwrap(), e);
        }
        assert_eq!(storage.get_entry(1, 3).unwrap(), entry(1, 3, b"payload"));

        storage.flush().unwrap();
        assert_eq!(storage.write_cache_count(), 0);
        assert_eq!(storage.get_entry(1, 3).unwrap(), entry(1, 3, b"payload"));
        assert_eq!(storage.get_entry(1, LAST_ADD_CONFIRMED).unwrap(), entry(1, 9, b"payload"));
        assert_eq!(storage.get_last_add_confirmed(1).unwrap(), 8);
        storage.shutdown().unwrap();
    }

    #[test]
    fn flush_with_nothing_pending_is_noop() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.flush().unwrap();
        storage.flush().unwrap();
        assert!(storage.get_entry_logger().log_ids().unwrap().is_empty());
    }

    #[test]
    fn master_key_conflicts() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.set_master_key(5, b"").unwrap();
        storage.set_master_key(5, b"").unwrap();
        assert!(matches!(
            storage.set_master_key(5, b"other"),
            Err(CoreError::MasterKeyMismatch { ledger_id: 5 })
        ));
        assert!(storage.set_master_key(-1, b"").unwrap_err().is_validation());
        assert_eq!(storage.read_master_key(5).unwrap(), b"".to_vec());
    }

    #[test]
    fn missing_entries_are_classified() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        assert!(matches!(
            storage.get_entry(7, 0),
            Err(CoreError::NoLedger { ledger_id: 7 })
        ));

        storage.set_master_key(7, b"k").unwrap();
        assert!(matches!(
            storage.get_entry(7, 0),
            Err(CoreError::NoEntry { entry_id: 0, .. })
        ));

        storage.set_limbo_state(7).unwrap();
        assert!(matches!(
            storage.get_entry(7, 0),
            Err(CoreError::DataUnknown { ledger_id: 7 })
        ));
        assert!(storage.get_entry(-3, 0).unwrap_err().is_validation());
    }

    #[test]
    fn limbo_hides_fenced_state_until_entries_exist() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.set_master_key(2, b"k").unwrap();
        storage.set_fenced(2).unwrap();
        storage.set_limbo_state(2).unwrap();
        assert!(storage.has_limbo_state(2).unwrap());
        assert!(storage.is_fenced(2).unwrap_err().is_data_unknown());

        storage.add_entry(entry(2, 0, b"x")).unwrap();
        assert!(storage.is_fenced(2).unwrap());

        storage.clear_limbo_state(2).unwrap();
        assert!(!storage.has_limbo_state(2).unwrap());
        assert!(storage.is_fenced(2).unwrap());
    }

    #[test]
    fn limbo_only_record_is_not_a_ledger() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.set_limbo_state(9).unwrap();
        assert!(!storage.ledger_exists(9).unwrap());
        assert!(storage.get_active_ledgers_in_range(0, 100).unwrap().is_empty());

        storage.clear_limbo_state(9).unwrap();
        assert!(matches!(
            storage.has_limbo_state(9),
            Err(CoreError::NoLedger { ledger_id: 9 })
        ));
        storage.clear_limbo_state(10).unwrap();
    }

    #[test]
    fn relocation_returns_new_payload() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.set_master_key(1, b"k").unwrap();
        storage.add_entry(entry(1, 0, b"old")).unwrap();
        storage.flush().unwrap();
        assert_eq!(storage.get_entry(1, 0).unwrap(), entry(1, 0, b"old"));

        let logger = storage.get_entry_logger();
        let location = logger.add_entry(1, &entry(1, 0, b"new")).unwrap();
        logger.flush().unwrap();
        storage
            .update_entries_locations(&[EntryLocation::new(1, 0, location)])
            .unwrap();

        assert_eq!(storage.get_entry(1, 0).unwrap(), entry(1, 0, b"new"));
    }

    #[test]
    fn add_ledger_to_index_requires_pages() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));

        let empty = PageEntriesSnapshot::new(4, Vec::new());
        assert!(matches!(
            storage.add_ledger_to_index(4, false, b"k", &empty),
            Err(CoreError::EmptyPages { ledger_id: 4 })
        ));
        assert!(!storage.ledger_exists(4).unwrap());

        let logger = storage.get_entry_logger();
        let mut page = IndexPage::new(0, 8);
        for e in 0..3 {
            page.set(e, logger.add_entry(4, &entry(4, e, b"imported")).unwrap());
        }
        logger.flush().unwrap();

        let pages = PageEntriesSnapshot::new(4, vec![page]);
        assert_eq!(storage.add_ledger_to_index(4, true, b"k", &pages).unwrap(), 3);
        assert!(storage.ledger_exists(4).unwrap());
        assert!(storage.is_fenced(4).unwrap());
        assert_eq!(storage.get_entry(4, 2).unwrap(), entry(4, 2, b"imported"));
    }

    #[test]
    fn full_cache_flushes_in_background() {
        let dir = tempdir().unwrap();
        let config = config(&dir).write_cache_max_size(1024);
        let storage = open(&config);

        for e in 0..100 {
            storage.add_entry(entry(3, e, &[7u8; 100])).unwrap();
        }
        storage.flush().unwrap();
        for e in 0..100 {
            assert_eq!(storage.get_entry(3, e).unwrap(), entry(3, e, &[7u8; 100]));
        }
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let dir = tempdir().unwrap();
        let storage = open(&config(&dir));
        storage.add_entry(entry(1, 0, b"x")).unwrap();
        storage.shutdown().unwrap();
        storage.shutdown().unwrap();

        assert!(matches!(
            storage.add_entry(entry(1, 1, b"x")),
            Err(CoreError::ShutDown)
        ));
        assert!(matches!(storage.get_entry(1, 0), Err(CoreError::ShutDown)));
    }
}
