//! Interleaved storage behind a sorting memtable.

use super::{InterleavedLedgerStorage, LedgerStorage};
use crate::cache::WriteCache;
use crate::config::StorageConfig;
use crate::error::{CoreError, CoreResult};
use crate::gc::{GcStats, LedgerManager};
use crate::index::PageEntriesSnapshot;
use crate::journal::FenceRecords;
use crate::types::{
    parse_entry_ids, parse_last_add_confirmed, validate_ledger_id, StorageStateFlag,
    LAST_ADD_CONFIRMED,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// [`InterleavedLedgerStorage`] with a memtable in front of it.
///
/// Entries are collected in the memtable and appended to the entry log in
/// `(ledgerId, entryId)` order when it fills up or on flush, so the entries
/// of one ledger end up next to each other in the log.
pub struct SortedLedgerStorage {
    inner: InterleavedLedgerStorage,
    memtable: WriteCache,
    drain_lock: Mutex<()>,
}

impl SortedLedgerStorage {
    /// Opens the engine. The memtable holds up to `write_cache_max_size`
    /// bytes.
    ///
    /// # Errors
    ///
    /// See [`InterleavedLedgerStorage::open`].
    pub fn open(config: &StorageConfig, ledger_manager: Arc<dyn LedgerManager>) -> CoreResult<Self> {
        Ok(Self {
            inner: InterleavedLedgerStorage::open(config, ledger_manager)?,
            memtable: WriteCache::new(config.write_cache_max_size),
            drain_lock: Mutex::new(()),
        })
    }

    /// The storage the memtable drains into.
    #[must_use]
    pub fn inner(&self) -> &InterleavedLedgerStorage {
        &self.inner
    }

    /// The index pages of a ledger, including drained entries only.
    ///
    /// # Errors
    ///
    /// See [`InterleavedLedgerStorage::get_index_entries`].
    pub fn get_index_entries(&self, ledger_id: i64) -> CoreResult<PageEntriesSnapshot> {
        self.inner.get_index_entries(ledger_id)
    }

    /// Writes the memtable to the entry log, in key order.
    fn drain(&self) -> CoreResult<()> {
        let _guard = self.drain_lock.lock();
        if let Some(leftover) = self.memtable.flushing() {
            for (ledger_id, entry_id, data) in leftover.iter() {
                self.inner.append(ledger_id, entry_id, data)?;
            }
            self.memtable.clear_flushing();
        }
        if let Some(generation) = self.memtable.swap() {
            for (ledger_id, entry_id, data) in generation.iter() {
                self.inner.append(ledger_id, entry_id, data)?;
            }
            self.memtable.clear_flushing();
            debug!(entries = generation.len(), "drained memtable");
        }
        Ok(())
    }

    fn cached_last_entry(&self, ledger_id: i64) -> Option<(i64, Bytes)> {
        self.memtable.last_entry(ledger_id)
    }
}

impl LedgerStorage for SortedLedgerStorage {
    fn start(&self) -> CoreResult<()> {
        self.inner.start()
    }

    fn shutdown(&self) -> CoreResult<()> {
        let drained = self.inner.check_open().and_then(|()| self.drain());
        let shut_down = self.inner.shutdown();
        drained.and(shut_down)
    }

    fn ledger_exists(&self, ledger_id: i64) -> CoreResult<bool> {
        self.inner.ledger_exists(ledger_id)
    }

    fn entry_exists(&self, ledger_id: i64, entry_id: i64) -> CoreResult<bool> {
        validate_ledger_id(ledger_id)?;
        self.inner.check_open()?;
        let cached = if entry_id == LAST_ADD_CONFIRMED {
            self.memtable.has_entries(ledger_id)
        } else {
            self.memtable.get(ledger_id, entry_id).is_some()
        };
        Ok(cached || self.inner.entry_exists(ledger_id, entry_id)?)
    }

    fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        self.inner.set_fenced(ledger_id)
    }

    fn fence_records(&self) -> &FenceRecords {
        self.inner.fence_records()
    }

    fn is_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        self.inner.is_fenced(ledger_id)
    }

    fn set_master_key(&self, ledger_id: i64, master_key: &[u8]) -> CoreResult<()> {
        self.inner.set_master_key(ledger_id, master_key)
    }

    fn read_master_key(&self, ledger_id: i64) -> CoreResult<Vec<u8>> {
        self.inner.read_master_key(ledger_id)
    }

    fn add_entry(&self, entry: Bytes) -> CoreResult<i64> {
        self.inner.check_open()?;
        let (ledger_id, entry_id) = parse_entry_ids(&entry)?;
        let lac = parse_last_add_confirmed(&entry);
        if !self.memtable.put(ledger_id, entry_id, entry.clone()) {
            self.drain()?;
            // An empty memtable takes any entry.
            self.memtable.put(ledger_id, entry_id, entry);
        }
        self.inner.note_entry(ledger_id, entry_id, lac);
        Ok(entry_id)
    }

    fn get_entry(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Bytes> {
        validate_ledger_id(ledger_id)?;
        self.inner.check_open()?;
        if entry_id == LAST_ADD_CONFIRMED {
            return self.get_last_entry(ledger_id);
        }
        if let Some(data) = self.memtable.get(ledger_id, entry_id) {
            return Ok(data);
        }
        match self.inner.get_entry(ledger_id, entry_id) {
            Err(CoreError::NoLedger { .. }) if self.memtable.has_entries(ledger_id) => {
                Err(CoreError::NoEntry {
                    ledger_id,
                    entry_id,
                })
            }
            other => other,
        }
    }

    fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Bytes> {
        validate_ledger_id(ledger_id)?;
        self.inner.check_open()?;
        let cached = self.cached_last_entry(ledger_id);
        let indexed = self.inner.last_indexed_entry(ledger_id).map(|(e, _)| e);
        match (cached, indexed) {
            (Some((cached_id, data)), Some(indexed_id)) if cached_id >= indexed_id => Ok(data),
            (Some((_, data)), None) => Ok(data),
            _ => self.inner.get_last_entry(ledger_id),
        }
    }

    fn get_last_add_confirmed(&self, ledger_id: i64) -> CoreResult<i64> {
        self.inner.get_last_add_confirmed(ledger_id)
    }

    fn flush(&self) -> CoreResult<()> {
        self.inner.check_open()?;
        self.drain()?;
        self.inner.flush()
    }

    fn delete_ledger(&self, ledger_id: i64) -> CoreResult<()> {
        validate_ledger_id(ledger_id)?;
        let _guard = self.drain_lock.lock();
        self.memtable.delete_ledger(ledger_id);
        self.inner.delete_ledger(ledger_id)
    }

    fn get_active_ledgers_in_range(&self, first: i64, last: i64) -> CoreResult<Vec<i64>> {
        self.inner.get_active_ledgers_in_range(first, last)
    }

    fn set_explicit_lac(&self, ledger_id: i64, lac: Bytes) -> CoreResult<()> {
        self.inner.set_explicit_lac(ledger_id, lac)
    }

    fn get_explicit_lac(&self, ledger_id: i64) -> CoreResult<Option<Bytes>> {
        self.inner.get_explicit_lac(ledger_id)
    }

    fn get_storage_state_flags(&self) -> CoreResult<BTreeSet<StorageStateFlag>> {
        self.inner.get_storage_state_flags()
    }

    fn set_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.inner.set_storage_state_flag(flag)
    }

    fn clear_storage_state_flag(&self, flag: StorageStateFlag) -> CoreResult<()> {
        self.inner.clear_storage_state_flag(flag)
    }

    fn force_gc(&self) -> CoreResult<GcStats> {
        self.inner.force_gc()
    }
}

impl fmt::Debug for SortedLedgerStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedLedgerStorage")
            .field("inner", &self.inner)
            .field("memtable", &self.memtable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::AllLedgersActive;
    use crate::index::PageEntriesIterable;
    use tempfile::tempdir;

    fn entry(ledger_id: i64, entry_id: i64) -> Bytes {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ledger_id.to_be_bytes());
        buf.extend_from_slice(&entry_id.to_be_bytes());
        buf.extend_from_slice(&(entry_id - 1).to_be_bytes());
        buf.extend_from_slice(&[0xAB; 32]);
        Bytes::from(buf)
    }

    #[test]
    fn memtable_drains_in_key_order() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new()
            .ledger_dir(dir.path())
            .write_cache_max_size(100_000)
            .write_buffer_size(4096)
            .buffer_pool_size(4);
        let storage = SortedLedgerStorage::open(&config, Arc::new(AllLedgersActive)).unwrap();

        for e in (0..5).rev() {
            storage.add_entry(entry(2, e)).unwrap();
            storage.add_entry(entry(1, e)).unwrap();
        }
        assert_eq!(storage.get_entry(1, 3).unwrap(), entry(1, 3));
        assert_eq!(storage.get_index_entries(1).unwrap().page_count(), 0);

        storage.flush().unwrap();
        let pages = storage.get_index_entries(1).unwrap();
        let locations: Vec<_> = pages
            .pages()
            .flat_map(|page| page.unwrap().entries().map(|(_, l)| l).collect::<Vec<_>>())
            .collect();
        assert_eq!(locations.len(), 5);
        assert!(locations.windows(2).all(|w| w[0].offset() < w[1].offset()));

        // Ledger 1 sorts before ledger 2, so all its entries come first
        let first_of_two = storage
            .get_index_entries(2)
            .unwrap()
            .pages()
            .next()
            .unwrap()
            .unwrap()
            .get(0)
            .unwrap();
        assert!(locations[4].offset() < first_of_two.offset());
        assert_eq!(storage.get_entry(2, LAST_ADD_CONFIRMED).unwrap(), entry(2, 4));
    }

    #[test]
    fn full_memtable_drains_on_add() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new()
            .ledger_dir(dir.path())
            .write_cache_max_size(200)
            .write_buffer_size(4096)
            .buffer_pool_size(4);
        let storage = SortedLedgerStorage::open(&config, Arc::new(AllLedgersActive)).unwrap();

        for e in 0..20 {
            storage.add_entry(entry(7, e)).unwrap();
        }
        assert!(storage.get_index_entries(7).unwrap().page_count() > 0);
        for e in 0..20 {
            assert_eq!(storage.get_entry(7, e).unwrap(), entry(7, e));
        }
        assert!(matches!(
            storage.get_entry(7, 20),
            Err(CoreError::NoEntry { .. })
        ));
    }
}
