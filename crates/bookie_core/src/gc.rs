//! Garbage collection and entry log compaction.
//!
//! A collection run has two phases:
//!
//! 1. Ledgers that still have metadata but that the [`LedgerManager`] no
//!    longer reports active are deleted from the index.
//! 2. Every entry log other than the one being written is scanned and its
//!    live ratio computed: an entry is live if the location index still
//!    points at the scanned record. Logs with no live entries are removed.
//!    Logs whose ratio is under the threshold are compacted: live entries
//!    are copied to the current log, the logger is flushed, the index is
//!    updated in one batch and the old log is removed.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** lose a live entry: the old log is removed only
//!   after the copies are durable and indexed
//! - A failed run leaves the previously durable state unchanged

use crate::error::CoreResult;
use crate::storage::SingleDirectoryDbLedgerStorage;
use crate::types::EntryLocation;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Answers whether a ledger still exists in the cluster metadata.
pub trait LedgerManager: Send + Sync {
    /// Returns false once the ledger has been deleted.
    fn is_active(&self, ledger_id: i64) -> CoreResult<bool>;
}

/// A ledger manager that never deletes anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllLedgersActive;

impl LedgerManager for AllLedgersActive {
    fn is_active(&self, _ledger_id: i64) -> CoreResult<bool> {
        Ok(true)
    }
}

/// A ledger manager backed by an in-memory set of deleted ledgers.
#[derive(Debug, Default)]
pub struct InMemoryLedgerManager {
    deleted: RwLock<BTreeSet<i64>>,
}

impl InMemoryLedgerManager {
    /// Creates a manager in which every ledger is active.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a ledger as deleted.
    pub fn delete(&self, ledger_id: i64) {
        self.deleted.write().insert(ledger_id);
    }
}

impl LedgerManager for InMemoryLedgerManager {
    fn is_active(&self, ledger_id: i64) -> CoreResult<bool> {
        Ok(!self.deleted.read().contains(&ledger_id))
    }
}

/// Result of a collection run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct GcStats {
    /// Ledgers deleted because they are no longer active.
    pub ledgers_deleted: usize,
    /// Logs removed because nothing in them was live.
    pub logs_removed: usize,
    /// Logs rewritten and removed.
    pub logs_compacted: usize,
    /// Entries copied out of compacted logs.
    pub entries_relocated: usize,
    /// Bytes of log files removed.
    pub bytes_reclaimed: u64,
    /// Whether the run used the major threshold.
    pub major: bool,
}

impl GcStats {
    /// Adds the counters of another run.
    pub fn merge(&mut self, other: &GcStats) {
        self.ledgers_deleted += other.ledgers_deleted;
        self.logs_removed += other.logs_removed;
        self.logs_compacted += other.logs_compacted;
        self.entries_relocated += other.entries_relocated;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.major |= other.major;
    }
}

/// Live data found in one entry log.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LogUsage {
    /// Entries still referenced by the index.
    pub live_entries: usize,
    /// Bytes of live records.
    pub live_bytes: u64,
    /// Entries found in the log.
    pub total_entries: usize,
    /// Bytes of all records.
    pub total_bytes: u64,
}

impl LogUsage {
    /// Fraction of record bytes still live. An empty log has ratio 0.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.live_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Deletes inactive ledgers and compacts entry logs.
pub struct GarbageCollector {
    ledger_manager: Arc<dyn LedgerManager>,
    minor_threshold: f64,
    major_threshold: f64,
}

impl GarbageCollector {
    /// Creates a collector.
    pub fn new(
        ledger_manager: Arc<dyn LedgerManager>,
        minor_threshold: f64,
        major_threshold: f64,
    ) -> Self {
        Self {
            ledger_manager,
            minor_threshold,
            major_threshold,
        }
    }

    /// The collaborator deciding which ledgers are still active.
    #[must_use]
    pub fn ledger_manager(&self) -> &Arc<dyn LedgerManager> {
        &self.ledger_manager
    }

    /// Returns the ids in `ledgers` that are no longer active.
    pub fn inactive_ledgers(&self, ledgers: &[i64]) -> CoreResult<Vec<i64>> {
        let mut inactive = Vec::new();
        for &ledger_id in ledgers {
            if !self.ledger_manager.is_active(ledger_id)? {
                inactive.push(ledger_id);
            }
        }
        Ok(inactive)
    }

    /// Runs one collection over a storage directory.
    pub fn run(&self, storage: &SingleDirectoryDbLedgerStorage, major: bool) -> CoreResult<GcStats> {
        let mut stats = GcStats {
            major,
            ..GcStats::default()
        };

        let ledgers = storage.ledger_index().active_ledgers_in_range(0, i64::MAX)?;
        for ledger_id in self.inactive_ledgers(&ledgers)? {
            storage.delete_ledger_internal(ledger_id)?;
            stats.ledgers_deleted += 1;
        }

        // Usage is computed from the index; cached entries go in first.
        storage.flush_internal()?;

        let threshold = if major {
            self.major_threshold
        } else {
            self.minor_threshold
        };
        let logger = storage.entry_logger();
        let current = logger.current_log_id();
        for log_id in logger.log_ids()? {
            if Some(log_id) == current {
                continue;
            }
            let _guard = storage.flush_lock();
            let usage = log_usage(storage, log_id)?;
            debug!(log_id, ratio = usage.ratio(), live = usage.live_entries, "entry log usage");

            if usage.live_entries == 0 {
                let size = logger.log_size(log_id)?;
                logger.remove_entry_log(log_id)?;
                stats.logs_removed += 1;
                stats.bytes_reclaimed += size;
            } else if usage.ratio() < threshold {
                let size = logger.log_size(log_id)?;
                stats.entries_relocated += compact_log(storage, log_id)?;
                stats.logs_compacted += 1;
                stats.bytes_reclaimed += size;
            }
        }

        info!(
            major,
            ledgers_deleted = stats.ledgers_deleted,
            logs_removed = stats.logs_removed,
            logs_compacted = stats.logs_compacted,
            "garbage collection finished"
        );
        Ok(stats)
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("minor_threshold", &self.minor_threshold)
            .field("major_threshold", &self.major_threshold)
            .finish_non_exhaustive()
    }
}

/// Computes the live data of a log. The caller holds the flush lock.
pub(crate) fn log_usage(storage: &SingleDirectoryDbLedgerStorage, log_id: u32) -> CoreResult<LogUsage> {
    let index = storage.location_index();
    let mut usage = LogUsage::default();
    storage.entry_logger().scan_entry_log(log_id, |entry| {
        let size = entry.record_size();
        usage.total_entries += 1;
        usage.total_bytes += size;
        if index.get_location(entry.ledger_id, entry.entry_id)? == Some(entry.location) {
            usage.live_entries += 1;
            usage.live_bytes += size;
        }
        Ok(())
    })?;
    Ok(usage)
}

/// Copies the live entries of a log and removes it. The caller holds the
/// flush lock.
fn compact_log(storage: &SingleDirectoryDbLedgerStorage, log_id: u32) -> CoreResult<usize> {
    let logger = storage.entry_logger();
    let index = storage.location_index();

    let mut relocated = Vec::new();
    logger.scan_entry_log(log_id, |entry| {
        if index.get_location(entry.ledger_id, entry.entry_id)? == Some(entry.location) {
            let location = logger.add_entry(entry.ledger_id, entry.data)?;
            relocated.push(EntryLocation::new(entry.ledger_id, entry.entry_id, location));
        }
        Ok(())
    })?;

    logger.flush()?;
    storage.apply_locations(&relocated)?;
    logger.remove_entry_log(log_id)?;
    info!(log_id, entries = relocated.len(), "compacted entry log");
    Ok(relocated.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_ratio() {
        let usage = LogUsage {
            live_entries: 1,
            live_bytes: 25,
            total_entries: 4,
            total_bytes: 100,
        };
        assert!((usage.ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(LogUsage::default().ratio(), 0.0);
    }

    #[test]
    fn in_memory_manager_tracks_deletions() {
        let manager = InMemoryLedgerManager::new();
        manager.delete(2);
        let gc = GarbageCollector::new(Arc::new(manager), 0.2, 0.8);
        assert_eq!(gc.inactive_ledgers(&[1, 2, 3]).unwrap(), vec![2]);

        let keep_all = GarbageCollector::new(Arc::new(AllLedgersActive), 0.2, 0.8);
        assert!(keep_all.inactive_ledgers(&[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn stats_merge() {
        let mut total = GcStats::default();
        total.merge(&GcStats {
            logs_removed: 1,
            bytes_reclaimed: 10,
            ..GcStats::default()
        });
        total.merge(&GcStats {
            logs_removed: 2,
            major: true,
            ..GcStats::default()
        });
        assert_eq!(total.logs_removed, 3);
        assert_eq!(total.bytes_reclaimed, 10);
        assert!(total.major);
    }
}
