//! Bounded cache of recently read entries.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Read cache with first-in first-out eviction, bounded by payload bytes.
pub struct ReadCache {
    max_size: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<(i64, i64), Bytes>,
    order: VecDeque<(i64, i64)>,
    size: u64,
}

impl ReadCache {
    /// Creates a cache holding up to `max_size` bytes. A zero size disables
    /// caching.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Caches an entry, evicting the oldest ones to make room.
    pub fn put(&self, ledger_id: i64, entry_id: i64, data: Bytes) {
        let len = data.len() as u64;
        if len > self.max_size {
            return;
        }

        let mut inner = self.inner.lock();
        let key = (ledger_id, entry_id);
        match inner.entries.insert(key, data) {
            Some(old) => inner.size -= old.len() as u64,
            None => inner.order.push_back(key),
        }
        inner.size += len;

        while inner.size > self.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.size -= evicted.len() as u64;
            }
        }
    }

    /// Looks an entry up.
    #[must_use]
    pub fn get(&self, ledger_id: i64, entry_id: i64) -> Option<Bytes> {
        self.inner.lock().entries.get(&(ledger_id, entry_id)).cloned()
    }

    /// Drops one entry.
    pub fn invalidate(&self, ledger_id: i64, entry_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&(ledger_id, entry_id)) {
            inner.size -= old.len() as u64;
            inner.order.retain(|k| *k != (ledger_id, entry_id));
        }
    }

    /// Drops every entry of a ledger.
    pub fn invalidate_ledger(&self, ledger_id: i64) {
        let mut inner = self.inner.lock();
        let Inner {
            entries,
            order,
            size,
        } = &mut *inner;
        entries.retain(|&(l, _), data| {
            if l == ledger_id {
                *size -= data.len() as u64;
                false
            } else {
                true
            }
        });
        order.retain(|&(l, _)| l != ledger_id);
    }

    /// Bytes currently cached.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Entries currently cached.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCache")
            .field("max_size", &self.max_size)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let cache = ReadCache::new(10);
        cache.put(1, 0, Bytes::from(vec![0u8; 4]));
        cache.put(1, 1, Bytes::from(vec![0u8; 4]));
        cache.put(1, 2, Bytes::from(vec![0u8; 4]));

        assert!(cache.get(1, 0).is_none());
        assert!(cache.get(1, 1).is_some());
        assert!(cache.get(1, 2).is_some());
        assert_eq!(cache.size(), 8);
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let cache = ReadCache::new(10);
        cache.put(1, 0, Bytes::from(vec![0u8; 11]));
        assert_eq!(cache.count(), 0);

        let disabled = ReadCache::new(0);
        disabled.put(1, 0, Bytes::from_static(b"x"));
        assert!(disabled.get(1, 0).is_none());
    }

    #[test]
    fn invalidation() {
        let cache = ReadCache::new(100);
        cache.put(1, 0, Bytes::from_static(b"a"));
        cache.put(1, 1, Bytes::from_static(b"b"));
        cache.put(2, 0, Bytes::from_static(b"c"));

        cache.invalidate(1, 0);
        assert!(cache.get(1, 0).is_none());
        cache.invalidate_ledger(1);
        assert!(cache.get(1, 1).is_none());
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.size(), 1);
    }
}
