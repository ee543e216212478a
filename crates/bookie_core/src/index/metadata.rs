//! Persistent per-ledger metadata and storage state flags.

use crate::error::{CoreError, CoreResult};
use crate::kv::KeyValueStorage;
use crate::types::StorageStateFlag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const LEDGER_PREFIX: u8 = b'L';
const STORAGE_STATE_KEY: &[u8] = b"S:storage-state";
const LOCK_STRIPES: usize = 16;

/// Metadata kept for each ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerData {
    /// False for records created only to hold limbo state.
    pub exists: bool,
    /// Whether the ledger is fenced.
    pub fenced: bool,
    /// Whether the ledger is in limbo.
    pub limbo: bool,
    /// Master key. Empty is a valid key.
    pub master_key: Vec<u8>,
    /// Last explicit LAC received for the ledger.
    pub explicit_lac: Option<Vec<u8>>,
}

impl LedgerData {
    /// Metadata for a ledger created with `master_key`.
    #[must_use]
    pub fn with_master_key(master_key: &[u8]) -> Self {
        Self {
            exists: true,
            master_key: master_key.to_vec(),
            ..Self::default()
        }
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

/// Index of [`LedgerData`] records keyed by ledger id.
///
/// Read-modify-write updates go through [`LedgerMetadataIndex::modify`],
/// which serializes updates of the same ledger without blocking unrelated
/// ledgers (locks are striped by ledger id).
pub struct LedgerMetadataIndex {
    kv: Box<dyn KeyValueStorage>,
    stripes: Vec<Mutex<()>>,
    state_lock: Mutex<()>,
}

impl LedgerMetadataIndex {
    /// Wraps a key-value store.
    pub fn new(kv: Box<dyn KeyValueStorage>) -> Self {
        Self {
            kv,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            state_lock: Mutex::new(()),
        }
    }

    /// Metadata of a ledger.
    pub fn get(&self, ledger_id: i64) -> CoreResult<Option<LedgerData>> {
        self.kv
            .get(&ledger_key(ledger_id))?
            .map(|bytes| LedgerData::decode(&bytes))
            .transpose()
    }

    /// Metadata of a ledger, failing with `NoLedger` when absent.
    pub fn get_existing(&self, ledger_id: i64) -> CoreResult<LedgerData> {
        self.get(ledger_id)?
            .ok_or(CoreError::NoLedger { ledger_id })
    }

    /// Replaces the metadata of a ledger.
    pub fn set(&self, ledger_id: i64, data: &LedgerData) -> CoreResult<()> {
        self.kv.put(&ledger_key(ledger_id), &data.encode()?)
    }

    /// Atomically reads, updates and writes back the metadata of a ledger.
    ///
    /// `f` sees `None` for unknown ledgers and may create, change or remove
    /// the record. Nothing is written if the record is unchanged.
    pub fn modify<R>(
        &self,
        ledger_id: i64,
        f: impl FnOnce(&mut Option<LedgerData>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let _guard = self.stripes[ledger_id.unsigned_abs() as usize % LOCK_STRIPES].lock();
        let before = self.get(ledger_id)?;
        let mut after = before.clone();
        let result = f(&mut after)?;

        if after != before {
            match &after {
                Some(data) => self.set(ledger_id, data)?,
                None => self.kv.delete(&ledger_key(ledger_id))?,
            }
        }
        Ok(result)
    }

    /// Removes the metadata of a ledger. Returns whether it existed.
    pub fn delete(&self, ledger_id: i64) -> CoreResult<bool> {
        self.modify(ledger_id, |data| Ok(data.take().is_some()))
    }

    /// Metadata of a ledger that exists. Records that only hold limbo state
    /// count as absent.
    pub fn existing(&self, ledger_id: i64) -> CoreResult<LedgerData> {
        match self.get(ledger_id)? {
            Some(data) if data.exists => Ok(data),
            _ => Err(CoreError::NoLedger { ledger_id }),
        }
    }

    /// Registers the master key of a ledger, creating it if needed.
    ///
    /// The same key again is a no-op; a different key fails with
    /// `MasterKeyMismatch`.
    pub fn set_master_key(&self, ledger_id: i64, master_key: &[u8]) -> CoreResult<()> {
        self.modify(ledger_id, |data| {
            if let Some(existing) = data.as_mut() {
                if existing.exists && existing.master_key != master_key {
                    return Err(CoreError::MasterKeyMismatch { ledger_id });
                }
                existing.exists = true;
                existing.master_key = master_key.to_vec();
                return Ok(());
            }
            *data = Some(LedgerData::with_master_key(master_key));
            Ok(())
        })
    }

    /// Fences a ledger. Returns whether the flag changed.
    pub fn set_fenced(&self, ledger_id: i64) -> CoreResult<bool> {
        self.modify(ledger_id, |data| {
            let data = data.as_mut().ok_or(CoreError::NoLedger { ledger_id })?;
            Ok(!std::mem::replace(&mut data.fenced, true))
        })
    }

    /// Stores the explicit LAC of a ledger.
    pub fn set_explicit_lac(&self, ledger_id: i64, lac: &[u8]) -> CoreResult<()> {
        self.modify(ledger_id, |data| {
            let data = data.as_mut().ok_or(CoreError::NoLedger { ledger_id })?;
            data.explicit_lac = Some(lac.to_vec());
            Ok(())
        })
    }

    /// Ids of existing ledgers with `first <= id < last`, ascending.
    pub fn active_ledgers_in_range(&self, first: i64, last: i64) -> CoreResult<Vec<i64>> {
        if first >= last {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for (key, value) in self.kv.range(&ledger_key(first), &ledger_key(last))? {
            if let Some(id) = decode_ledger_key(&key) {
                if LedgerData::decode(&value)?.exists {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Ids of every ledger with a metadata record, including limbo-only
    /// records.
    pub fn all_ledgers(&self) -> CoreResult<Vec<i64>> {
        Ok(self
            .kv
            .range(&ledger_key(0), &ledger_key(i64::MAX))?
            .into_iter()
            .filter_map(|(key, _)| decode_ledger_key(&key))
            .collect())
    }

    /// Persisted storage state flags.
    pub fn storage_state_flags(&self) -> CoreResult<BTreeSet<StorageStateFlag>> {
        match self.kv.get(STORAGE_STATE_KEY)? {
            Some(bytes) => {
                ciborium::from_reader(bytes.as_slice()).map_err(|e| CoreError::codec(e.to_string()))
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Sets or clears one storage state flag, durably.
    pub fn update_storage_state_flag(&self, flag: StorageStateFlag, set: bool) -> CoreResult<()> {
        let _guard = self.state_lock.lock();
        let mut flags = self.storage_state_flags()?;
        let changed = if set {
            flags.insert(flag)
        } else {
            flags.remove(&flag)
        };
        if changed {
            let mut out = Vec::new();
            ciborium::into_writer(&flags, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
            self.kv.put(STORAGE_STATE_KEY, &out)?;
            self.kv.sync()?;
        }
        Ok(())
    }

    /// Number of metadata records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.kv.count()
    }

    /// Makes the metadata durable.
    pub fn sync(&self) -> CoreResult<()> {
        self.kv.sync()
    }

    /// Closes the underlying store.
    pub fn close(&self) -> CoreResult<()> {
        self.kv.close()
    }
}

impl fmt::Debug for LedgerMetadataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerMetadataIndex")
            .field("records", &self.count())
            .finish_non_exhaustive()
    }
}

fn ledger_key(ledger_id: i64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = LEDGER_PREFIX;
    key[1..].copy_from_slice(&ledger_id.to_be_bytes());
    key
}

fn decode_ledger_key(key: &[u8]) -> Option<i64> {
    if key.len() != 9 || key[0] != LEDGER_PREFIX {
        return None;
    }
    Some(i64::from_be_bytes(key[1..].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::LogKeyValueStorage;
    use tempfile::tempdir;

    fn index() -> LedgerMetadataIndex {
        LedgerMetadataIndex::new(Box::new(LogKeyValueStorage::in_memory("ledgers")))
    }

    #[test]
    fn modify_creates_and_updates() {
        let index = index();
        index
            .modify(3, |data| {
                *data = Some(LedgerData::with_master_key(b"key"));
                Ok(())
            })
            .unwrap();

        assert!(index.set_fenced(3).unwrap());
        assert!(!index.set_fenced(3).unwrap());

        let data = index.get_existing(3).unwrap();
        assert!(data.fenced);
        assert_eq!(data.master_key, b"key");
    }

    #[test]
    fn master_key_is_set_once() {
        let index = index();
        index.set_master_key(4, b"").unwrap();
        index.set_master_key(4, b"").unwrap();
        assert!(matches!(
            index.set_master_key(4, b"other"),
            Err(CoreError::MasterKeyMismatch { ledger_id: 4 })
        ));
        assert!(matches!(
            index.set_fenced(5),
            Err(CoreError::NoLedger { ledger_id: 5 })
        ));

        // A limbo-only record takes the key and becomes a ledger
        index
            .set(
                6,
                &LedgerData {
                    limbo: true,
                    ..LedgerData::default()
                },
            )
            .unwrap();
        assert!(index.existing(6).is_err());
        index.set_master_key(6, b"k").unwrap();
        let data = index.existing(6).unwrap();
        assert!(data.limbo);
        assert_eq!(data.master_key, b"k");
    }

    #[test]
    fn failed_modify_writes_nothing() {
        let index = index();
        let result: CoreResult<()> = index.modify(1, |data| {
            *data = Some(LedgerData::default());
            Err(CoreError::ShutDown)
        });
        assert!(result.is_err());
        assert!(index.get(1).unwrap().is_none());
    }

    #[test]
    fn active_range_skips_limbo_only_records() {
        let index = index();
        for id in [1, 5, 9, 12] {
            index.set(id, &LedgerData::with_master_key(b"")).unwrap();
        }
        index
            .set(
                7,
                &LedgerData {
                    limbo: true,
                    ..LedgerData::default()
                },
            )
            .unwrap();

        assert_eq!(index.active_ledgers_in_range(0, 10).unwrap(), vec![1, 5, 9]);
        assert_eq!(index.active_ledgers_in_range(5, 6).unwrap(), vec![5]);
        assert_eq!(index.all_ledgers().unwrap(), vec![1, 5, 7, 9, 12]);
    }

    #[test]
    fn state_flags_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledgers.kv");
        {
            let index =
                LedgerMetadataIndex::new(Box::new(LogKeyValueStorage::open_file(&path, true).unwrap()));
            index
                .update_storage_state_flag(StorageStateFlag::NeedsIntegrityCheck, true)
                .unwrap();
            index.close().unwrap();
        }

        let index =
            LedgerMetadataIndex::new(Box::new(LogKeyValueStorage::open_file(&path, true).unwrap()));
        let flags = index.storage_state_flags().unwrap();
        assert!(flags.contains(&StorageStateFlag::NeedsIntegrityCheck));

        index
            .update_storage_state_flag(StorageStateFlag::NeedsIntegrityCheck, false)
            .unwrap();
        assert!(index.storage_state_flags().unwrap().is_empty());
        // The flags record is not a ledger
        assert!(index.all_ledgers().unwrap().is_empty());
    }
}
