//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;

/// An in-memory append-only store.
///
/// Besides unit tests, the backend tracks how much of its data has been
/// synced so [`InMemoryBackend::crash`] can drop everything appended after
/// the last [`StorageBackend::sync`], mimicking a process crash.
///
/// # Example
///
/// ```rust
/// use bookie_storage::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.append(b"synced").unwrap();
/// backend.sync().unwrap();
/// backend.append(b"lost").unwrap();
/// backend.crash();
/// assert_eq!(backend.read_all().unwrap(), b"synced");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    synced_len: usize,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, all of it considered synced.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let synced_len = data.len();
        Self {
            inner: Mutex::new(MemoryState { data, synced_len }),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// Discards every byte appended since the last sync.
    pub fn crash(&self) {
        let mut state = self.inner.lock();
        let synced = state.synced_len;
        state.data.truncate(synced);
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.inner.lock();
        let size = state.data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(state.data[offset as usize..end as usize].to_vec())
    }

    fn append(&self, new_data: &[u8]) -> StorageResult<u64> {
        let mut state = self.inner.lock();
        let offset = state.data.len() as u64;
        state.data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.synced_len = state.data.len();
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().data.len() as u64)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut state = self.inner.lock();
        let current = state.data.len() as u64;
        if new_size > current {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {new_size} bytes, store only holds {current}"),
            )));
        }

        state.data.truncate(new_size as usize);
        state.synced_len = state.synced_len.min(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn append_returns_offsets() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(10, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn crash_drops_unsynced_tail() {
        let backend = InMemoryBackend::new();
        backend.append(b"one").unwrap();
        backend.sync().unwrap();
        backend.append(b"two").unwrap();

        backend.crash();
        assert_eq!(backend.data(), b"one");
    }

    #[test]
    fn with_data_counts_as_synced() {
        let backend = InMemoryBackend::with_data(b"preloaded".to_vec());
        backend.crash();
        assert_eq!(backend.size().unwrap(), 9);
    }

    #[test]
    fn truncate_moves_sync_point() {
        let backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.sync().unwrap();

        backend.truncate(5).unwrap();
        backend.append(b"!").unwrap();
        backend.crash();
        assert_eq!(backend.data(), b"hello");
        assert!(backend.truncate(100).is_err());
    }
}
