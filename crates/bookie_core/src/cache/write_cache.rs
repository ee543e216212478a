//! Double-buffered write cache.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One generation of cached entries, ordered by `(ledgerId, entryId)`.
#[derive(Debug, Default, Clone)]
pub struct Generation {
    entries: BTreeMap<(i64, i64), Bytes>,
    size: u64,
}

impl Generation {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the generation holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Entries in `(ledgerId, entryId)` order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, &Bytes)> + '_ {
        self.entries.iter().map(|(&(l, e), data)| (l, e, data))
    }

    fn get(&self, ledger_id: i64, entry_id: i64) -> Option<Bytes> {
        self.entries.get(&(ledger_id, entry_id)).cloned()
    }

    fn last_entry(&self, ledger_id: i64) -> Option<(i64, Bytes)> {
        self.entries
            .range((ledger_id, 0)..=(ledger_id, i64::MAX))
            .next_back()
            .map(|(&(_, e), data)| (e, data.clone()))
    }

    fn insert(&mut self, ledger_id: i64, entry_id: i64, data: Bytes) {
        let added = data.len() as u64;
        if let Some(old) = self.entries.insert((ledger_id, entry_id), data) {
            self.size -= old.len() as u64;
        }
        self.size += added;
    }

    fn remove_ledger(&mut self, ledger_id: i64) -> usize {
        let keys: Vec<_> = self
            .entries
            .range((ledger_id, 0)..=(ledger_id, i64::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(old) = self.entries.remove(key) {
                self.size -= old.len() as u64;
            }
        }
        keys.len()
    }
}

/// In-memory staging area for entries that have not been flushed yet.
///
/// Writers insert into the *active* generation. A flush swaps it for an empty
/// one and drains the old generation, which stays readable as the
/// *flushing* generation until its entries are indexed. The swap takes both
/// generation locks, so no insert can land in a generation after it was
/// handed to the flush.
pub struct WriteCache {
    max_size: u64,
    active: RwLock<Generation>,
    flushing: RwLock<Option<Arc<Generation>>>,
}

impl WriteCache {
    /// Creates a cache whose active generation holds up to `max_size` bytes.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            active: RwLock::new(Generation::default()),
            flushing: RwLock::new(None),
        }
    }

    /// Inserts or overwrites an entry in the active generation.
    ///
    /// Returns false without inserting if the entry does not fit. An empty
    /// generation accepts any single entry.
    pub fn put(&self, ledger_id: i64, entry_id: i64, data: Bytes) -> bool {
        let mut active = self.active.write();
        if !active.is_empty() && active.size + data.len() as u64 > self.max_size {
            return false;
        }
        active.insert(ledger_id, entry_id, data);
        true
    }

    /// Looks an entry up in the active, then the flushing generation.
    #[must_use]
    pub fn get(&self, ledger_id: i64, entry_id: i64) -> Option<Bytes> {
        if let Some(data) = self.active.read().get(ledger_id, entry_id) {
            return Some(data);
        }
        self.flushing
            .read()
            .as_ref()
            .and_then(|g| g.get(ledger_id, entry_id))
    }

    /// Highest cached entry of a ledger across both generations.
    #[must_use]
    pub fn last_entry(&self, ledger_id: i64) -> Option<(i64, Bytes)> {
        let active = self.active.read().last_entry(ledger_id);
        let flushing = self
            .flushing
            .read()
            .as_ref()
            .and_then(|g| g.last_entry(ledger_id));
        match (active, flushing) {
            (Some(a), Some(f)) => Some(if a.0 >= f.0 { a } else { f }),
            (a, f) => a.or(f),
        }
    }

    /// Returns true if any generation holds an entry of the ledger.
    #[must_use]
    pub fn has_entries(&self, ledger_id: i64) -> bool {
        self.last_entry(ledger_id).is_some()
    }

    /// Moves the active generation to the flushing slot.
    ///
    /// Returns `None` if the active generation is empty or a previous
    /// flushing generation has not been cleared yet.
    pub fn swap(&self) -> Option<Arc<Generation>> {
        let mut active = self.active.write();
        let mut flushing = self.flushing.write();
        if active.is_empty() || flushing.is_some() {
            return None;
        }
        let drained = Arc::new(std::mem::take(&mut *active));
        *flushing = Some(Arc::clone(&drained));
        Some(drained)
    }

    /// The generation currently being flushed, if any.
    #[must_use]
    pub fn flushing(&self) -> Option<Arc<Generation>> {
        self.flushing.read().clone()
    }

    /// Drops the flushing generation once its entries are indexed.
    pub fn clear_flushing(&self) {
        *self.flushing.write() = None;
    }

    /// Removes every cached entry of a ledger. Returns how many were removed.
    ///
    /// Must not run concurrently with a flush of the flushing generation.
    pub fn delete_ledger(&self, ledger_id: i64) -> usize {
        let mut removed = self.active.write().remove_ledger(ledger_id);
        let mut flushing = self.flushing.write();
        if let Some(generation) = flushing.as_mut() {
            if generation.last_entry(ledger_id).is_some() {
                let mut copy = Generation::clone(generation);
                removed += copy.remove_ledger(ledger_id);
                *generation = Arc::new(copy);
            }
        }
        removed
    }

    /// Bytes held by the active generation.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.active.read().size
    }

    /// Entries held across both generations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.active.read().len() + self.flushing.read().as_ref().map_or(0, |g| g.len())
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Capacity of the active generation.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}

impl fmt::Debug for WriteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCache")
            .field("max_size", &self.max_size)
            .field("size", &self.size())
            .field("count", &self.count())
            .finish()
    }
}
