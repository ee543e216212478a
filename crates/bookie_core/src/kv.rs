//! Ordered key-value storage used by the indexes.
//!
//! [`KeyValueStorage`] is the narrow interface the location and metadata
//! indexes need: point reads, writes, atomic batches and ordered range
//! scans. [`LogKeyValueStorage`] implements it as an in-memory ordered map
//! whose every change is first appended to a checksummed operation log on a
//! [`StorageBackend`]. Opening replays the log.
//!
//! ## Record format
//!
//! ```text
//! magic "BKKV" (4) | payload length u32 LE (4) | payload | crc32 u32 LE (4)
//!
//! payload = op count u32 LE, then per op:
//!     0x01 | key length u32 LE | key | value length u32 LE | value   (put)
//!     0x02 | key length u32 LE | key                                 (delete)
//! ```
//!
//! A batch is one record, so a torn write loses the batch as a whole.

use crate::error::{CoreError, CoreResult};
use bookie_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const RECORD_MAGIC: [u8; 4] = *b"BKKV";
const RECORD_HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;
const OP_PUT: u8 = 0x01;
const OP_DELETE: u8 = 0x02;

/// A key/value pair returned by range scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// A single change inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Key to write.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Key to remove.
        key: Vec<u8>,
    },
}

/// A set of changes applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    /// Number of queued changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The queued changes, in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Ordered map with atomic batches.
///
/// Readers observe each batch entirely or not at all.
pub trait KeyValueStorage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Removes `key`.
    fn delete(&self, key: &[u8]) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Applies a batch atomically.
    fn write(&self, batch: WriteBatch) -> CoreResult<()>;

    /// Returns all pairs with `start <= key < end`, in key order.
    fn range(&self, start: &[u8], end: &[u8]) -> CoreResult<Vec<KeyValue>>;

    /// Returns the greatest pair with `start <= key < end`.
    fn last_in_range(&self, start: &[u8], end: &[u8]) -> CoreResult<Option<KeyValue>> {
        Ok(self.range(start, end)?.pop())
    }

    /// Number of keys stored.
    fn count(&self) -> usize;

    /// Makes every applied change durable.
    fn sync(&self) -> CoreResult<()>;

    /// Syncs and closes the store. Later operations fail.
    fn close(&self) -> CoreResult<()>;
}

/// A [`KeyValueStorage`] backed by an operation log.
pub struct LogKeyValueStorage {
    name: String,
    backend: Box<dyn StorageBackend>,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LogKeyValueStorage {
    /// Opens a store over `backend`, replaying its log.
    ///
    /// A torn record at the end of the log is cut off when `repair` is set
    /// and ignored otherwise.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be read or a record in the middle of the
    /// log is damaged.
    pub fn open(
        name: impl Into<String>,
        backend: Box<dyn StorageBackend>,
        repair: bool,
    ) -> CoreResult<Self> {
        let name = name.into();
        let data = backend.read_all()?;
        let (map, valid_len) = replay(&data)?;

        if valid_len < data.len() {
            warn!(
                store = %name,
                valid = valid_len,
                size = data.len(),
                "discarding torn tail of key-value log"
            );
            if repair {
                backend.truncate(valid_len as u64)?;
            }
        }
        debug!(store = %name, keys = map.len(), "opened key-value store");

        Ok(Self {
            name,
            backend,
            map: RwLock::new(map),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens or creates a store in the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or replayed.
    pub fn open_file(path: &Path, repair: bool) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(path.display().to_string(), Box::new(backend), repair)
    }

    /// Creates an empty store held in memory.
    #[must_use]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: Box::new(InMemoryBackend::new()),
            map: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }
}

impl KeyValueStorage for LogKeyValueStorage {
    fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.map.read().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> CoreResult<()> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let _writer = self.write_lock.lock();
        self.backend.append(&encode_record(&batch)?)?;

        let mut map = self.map.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn range(&self, start: &[u8], end: &[u8]) -> CoreResult<Vec<KeyValue>> {
        self.check_open()?;
        if start >= end {
            return Ok(Vec::new());
        }
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> CoreResult<Option<KeyValue>> {
        self.check_open()?;
        if start >= end {
            return Ok(None);
        }
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn count(&self) -> usize {
        self.map.read().len()
    }

    fn sync(&self) -> CoreResult<()> {
        self.check_open()?;
        let _writer = self.write_lock.lock();
        self.backend.sync()?;
        Ok(())
    }

    fn close(&self) -> CoreResult<()> {
        let _writer = self.write_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.sync()?;
        debug!(store = %self.name, "closed key-value store");
        Ok(())
    }
}

impl fmt::Debug for LogKeyValueStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogKeyValueStorage")
            .field("name", &self.name)
            .field("keys", &self.count())
            .finish_non_exhaustive()
    }
}

fn encode_record(batch: &WriteBatch) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&len_u32(batch.ops.len())?.to_le_bytes());
    for op in &batch.ops {
        match op {
            BatchOp::Put { key, value } => {
                payload.push(OP_PUT);
                put_bytes(&mut payload, key)?;
                put_bytes(&mut payload, value)?;
            }
            BatchOp::Delete { key } => {
                payload.push(OP_DELETE);
                put_bytes(&mut payload, key)?;
            }
        }
    }

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + CRC_SIZE);
    record.extend_from_slice(&RECORD_MAGIC);
    record.extend_from_slice(&len_u32(payload.len())?.to_le_bytes());
    record.extend_from_slice(&payload);
    let crc = crc32fast::hash(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

fn len_u32(len: usize) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::invalid_entry("key-value record too large"))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    out.extend_from_slice(&len_u32(bytes.len())?.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Replays records into a map. Returns the map and the length of the valid
/// prefix of the log.
fn replay(data: &[u8]) -> CoreResult<(BTreeMap<Vec<u8>, Vec<u8>>, usize)> {
    let mut map = BTreeMap::new();
    let mut pos = 0;

    while pos < data.len() {
        let Some(header) = data.get(pos..pos + RECORD_HEADER_SIZE) else {
            break;
        };
        if header[..4] != RECORD_MAGIC {
            break;
        }
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let end = pos + RECORD_HEADER_SIZE + payload_len + CRC_SIZE;
        let Some(record) = data.get(pos..end) else {
            break;
        };

        let body = &record[..record.len() - CRC_SIZE];
        let tail = &record[record.len() - CRC_SIZE..];
        let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            if end == data.len() {
                break;
            }
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        apply_payload(&mut map, &body[RECORD_HEADER_SIZE..])?;
        pos = end;
    }

    Ok((map, pos))
}

fn apply_payload(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, payload: &[u8]) -> CoreResult<()> {
    let mut cursor = Cursor { data: payload, pos: 0 };
    let count = cursor.u32()?;
    for _ in 0..count {
        match cursor.u8()? {
            OP_PUT => {
                let key = cursor.bytes()?;
                let value = cursor.bytes()?;
                map.insert(key, value);
            }
            OP_DELETE => {
                let key = cursor.bytes()?;
                map.remove(&key);
            }
            other => {
                return Err(CoreError::corruption(format!(
                    "unknown key-value op 0x{other:02x}"
                )))
            }
        }
    }
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| CoreError::corruption("truncated key-value record"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_delete() {
        let kv = LogKeyValueStorage::in_memory("test");
        kv.put(b"a", b"1").unwrap();
        kv.put(b"b", b"2").unwrap();
        kv.put(b"a", b"3").unwrap();

        assert_eq!(kv.get(b"a").unwrap(), Some(b"3".to_vec()));
        kv.delete(b"a").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
        assert_eq!(kv.count(), 1);
    }

    #[test]
    fn range_is_half_open_and_ordered() {
        let kv = LogKeyValueStorage::in_memory("test");
        for key in [b"d", b"a", b"c", b"b"] {
            kv.put(key, key).unwrap();
        }

        let keys: Vec<_> = kv
            .range(b"b", b"d")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(kv.last_in_range(b"a", b"d").unwrap().unwrap().0, b"c");
        assert!(kv.range(b"d", b"a").unwrap().is_empty());
    }

    #[test]
    fn reopen_replays_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locations.kv");
        {
            let kv = LogKeyValueStorage::open_file(&path, true).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"x".to_vec(), b"1".to_vec());
            batch.put(b"y".to_vec(), b"2".to_vec());
            kv.write(batch).unwrap();
            kv.delete(b"x").unwrap();
            kv.close().unwrap();
        }

        let kv = LogKeyValueStorage::open_file(&path, true).unwrap();
        assert_eq!(kv.get(b"x").unwrap(), None);
        assert_eq!(kv.get(b"y").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_tail_is_repaired() {
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        let good = encode_record(&batch).unwrap();
        let mut data = good.clone();
        data.extend_from_slice(&good[..good.len() - 3]);

        let backend = InMemoryBackend::with_data(data);
        let kv = LogKeyValueStorage::open("test", Box::new(backend), true).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));

        // Appends after repair land right after the valid prefix
        kv.put(b"k2", b"v2").unwrap();
        assert_eq!(kv.count(), 2);
    }

    #[test]
    fn corrupt_middle_record_fails() {
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        let good = encode_record(&batch).unwrap();
        let mut data = good.clone();
        data[RECORD_HEADER_SIZE + 6] ^= 0xFF;
        data.extend_from_slice(&good);

        let result = LogKeyValueStorage::open("test", Box::new(InMemoryBackend::with_data(data)), true);
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn crash_loses_only_unsynced_batches() {
        use std::sync::Arc;

        struct Shared(Arc<InMemoryBackend>);
        impl StorageBackend for Shared {
            fn read_at(&self, offset: u64, len: usize) -> bookie_storage::StorageResult<Vec<u8>> {
                self.0.read_at(offset, len)
            }
            fn append(&self, data: &[u8]) -> bookie_storage::StorageResult<u64> {
                self.0.append(data)
            }
            fn sync(&self) -> bookie_storage::StorageResult<()> {
                self.0.sync()
            }
            fn size(&self) -> bookie_storage::StorageResult<u64> {
                self.0.size()
            }
            fn truncate(&self, new_size: u64) -> bookie_storage::StorageResult<()> {
                self.0.truncate(new_size)
            }
        }

        let backend = Arc::new(InMemoryBackend::new());
        let kv = LogKeyValueStorage::open("test", Box::new(Shared(Arc::clone(&backend))), true)
            .unwrap();
        kv.put(b"durable", b"1").unwrap();
        kv.sync().unwrap();
        kv.put(b"volatile", b"2").unwrap();

        backend.crash();
        let reopened =
            LogKeyValueStorage::open("test", Box::new(Shared(Arc::clone(&backend))), true).unwrap();
        assert!(reopened.get(b"durable").unwrap().is_some());
        assert!(reopened.get(b"volatile").unwrap().is_none());
    }

    #[test]
    fn closed_store_rejects_operations() {
        let kv = LogKeyValueStorage::in_memory("test");
        kv.close().unwrap();
        assert!(matches!(kv.get(b"a"), Err(CoreError::ShutDown)));
        assert!(matches!(kv.put(b"a", b"b"), Err(CoreError::ShutDown)));
    }
}
