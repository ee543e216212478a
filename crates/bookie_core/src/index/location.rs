//! Persistent `(ledgerId, entryId) -> location` index.

use crate::error::CoreResult;
use crate::kv::{KeyValueStorage, WriteBatch};
use crate::types::{EntryLocation, LogLocation};
use std::fmt;

/// Index mapping every flushed entry to its position in the entry logs.
///
/// Keys are 16 bytes: ledger id then entry id, both big-endian, so the
/// natural key order is ledger order, then entry order within a ledger.
pub struct EntryLocationIndex {
    kv: Box<dyn KeyValueStorage>,
}

impl EntryLocationIndex {
    /// Wraps a key-value store.
    pub fn new(kv: Box<dyn KeyValueStorage>) -> Self {
        Self { kv }
    }

    /// Location of one entry, if indexed.
    pub fn get_location(&self, ledger_id: i64, entry_id: i64) -> CoreResult<Option<LogLocation>> {
        Ok(self
            .kv
            .get(&entry_key(ledger_id, entry_id))?
            .and_then(|value| decode_location(&value)))
    }

    /// Highest indexed entry of a ledger.
    pub fn get_last_entry(&self, ledger_id: i64) -> CoreResult<Option<(i64, LogLocation)>> {
        let (start, end) = ledger_range(ledger_id);
        Ok(self
            .kv
            .last_in_range(&start, &end)?
            .and_then(|(key, value)| Some((decode_key(&key)?.1, decode_location(&value)?))))
    }

    /// All indexed entries of a ledger, in entry order.
    pub fn ledger_entries(&self, ledger_id: i64) -> CoreResult<Vec<(i64, LogLocation)>> {
        let (start, end) = ledger_range(ledger_id);
        Ok(self
            .kv
            .range(&start, &end)?
            .into_iter()
            .filter_map(|(key, value)| Some((decode_key(&key)?.1, decode_location(&value)?)))
            .collect())
    }

    /// Every indexed entry, in `(ledger, entry)` order.
    pub fn all_entries(&self) -> CoreResult<Vec<EntryLocation>> {
        Ok(self
            .kv
            .range(&entry_key(0, 0), &entry_key(i64::MAX, i64::MAX))?
            .into_iter()
            .filter_map(|(key, value)| {
                let (ledger_id, entry_id) = decode_key(&key)?;
                Some(EntryLocation::new(ledger_id, entry_id, decode_location(&value)?))
            })
            .collect())
    }

    /// Writes a set of locations in one atomic batch.
    ///
    /// Also used to relocate entries after compaction: existing keys are
    /// overwritten.
    pub fn add_locations(&self, locations: &[EntryLocation]) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        for loc in locations {
            batch.put(
                entry_key(loc.ledger_id, loc.entry_id).to_vec(),
                loc.location.as_u64().to_be_bytes().to_vec(),
            );
        }
        self.kv.write(batch)
    }

    /// Removes every entry of a ledger in one atomic batch.
    ///
    /// Returns the number of entries removed.
    pub fn delete_ledger(&self, ledger_id: i64) -> CoreResult<usize> {
        let (start, end) = ledger_range(ledger_id);
        let mut batch = WriteBatch::new();
        for (key, _) in self.kv.range(&start, &end)? {
            batch.delete(key);
        }
        let removed = batch.len();
        self.kv.write(batch)?;
        Ok(removed)
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.kv.count()
    }

    /// Makes the index durable.
    pub fn sync(&self) -> CoreResult<()> {
        self.kv.sync()
    }

    /// Closes the underlying store.
    pub fn close(&self) -> CoreResult<()> {
        self.kv.close()
    }
}

impl fmt::Debug for EntryLocationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryLocationIndex")
            .field("entries", &self.count())
            .finish()
    }
}

fn entry_key(ledger_id: i64, entry_id: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&ledger_id.to_be_bytes());
    key[8..].copy_from_slice(&entry_id.to_be_bytes());
    key
}

fn ledger_range(ledger_id: i64) -> ([u8; 16], [u8; 16]) {
    (entry_key(ledger_id, 0), entry_key(ledger_id, i64::MAX))
}

fn decode_key(key: &[u8]) -> Option<(i64, i64)> {
    let ledger = i64::from_be_bytes(key.get(..8)?.try_into().ok()?);
    let entry = i64::from_be_bytes(key.get(8..16)?.try_into().ok()?);
    Some((ledger, entry))
}

fn decode_location(value: &[u8]) -> Option<LogLocation> {
    Some(LogLocation::from_u64(u64::from_be_bytes(
        value.try_into().ok()?,
    )))
}
