//! Ledger storage configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest entry log a [`crate::types::LogLocation`] offset can address.
pub const MAX_ENTRY_LOG_SIZE: u64 = u32::MAX as u64;

/// Size of the header block at the start of every entry log.
pub const ENTRY_LOG_HEADER_SIZE: usize = 4096;

/// Which ledger storage engine to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LedgerStorageKind {
    /// Write cache, read cache and a key-value location index, one engine
    /// per ledger directory.
    #[default]
    Db,
    /// Entries go straight to the entry log; a paged per-ledger index tracks
    /// them.
    Interleaved,
    /// Interleaved storage behind an in-memory memtable that writes entries
    /// out sorted by ledger and entry id.
    Sorted,
}

impl fmt::Display for LedgerStorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Db => "db",
            Self::Interleaved => "interleaved",
            Self::Sorted => "sorted",
        })
    }
}

impl FromStr for LedgerStorageKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "db" => Ok(Self::Db),
            "interleaved" => Ok(Self::Interleaved),
            "sorted" => Ok(Self::Sorted),
            other => Err(CoreError::invalid_config(format!(
                "unknown ledger storage kind '{other}'"
            ))),
        }
    }
}

/// Configuration for opening ledger storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Ledger directories. Entry logs live in `<dir>/current`.
    pub ledger_dirs: Vec<PathBuf>,

    /// Optional index directories, one per ledger directory. When unset the
    /// index lives next to the entry logs.
    pub index_dirs: Option<Vec<PathBuf>>,

    /// Whether to create missing directories.
    pub create_if_missing: bool,

    /// Storage engine to open.
    pub storage_kind: LedgerStorageKind,

    /// Maximum bytes held by the active write cache generation, per
    /// directory.
    pub write_cache_max_size: u64,

    /// Maximum bytes held by the read cache, per directory.
    pub read_cache_max_size: u64,

    /// Entries read ahead into the read cache after a cache miss.
    pub read_ahead_batch_size: usize,

    /// Maximum size of a single entry log before rotation.
    pub entry_log_max_size: u64,

    /// Size of each write buffer handed to the entry log writer.
    pub write_buffer_size: usize,

    /// Alignment of every entry log write.
    pub alignment: usize,

    /// Number of write buffers per entry logger.
    pub buffer_pool_size: usize,

    /// Interval between background garbage collection runs (0 = never).
    pub gc_wait_time: Duration,

    /// Logs with a lower live ratio are compacted by minor collections.
    pub minor_compaction_threshold: f64,

    /// Logs with a lower live ratio are compacted by major collections.
    pub major_compaction_threshold: f64,

    /// Every this many background collections is a major one (0 = never).
    pub major_compaction_every: u32,

    /// How long `add_entry` waits for room in a full write cache.
    pub max_throttle_time: Duration,

    /// Slots per index page of the interleaved engine.
    pub entries_per_page: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_dirs: Vec::new(),
            index_dirs: None,
            create_if_missing: true,
            storage_kind: LedgerStorageKind::Db,
            write_cache_max_size: 64 * 1024 * 1024, // 64 MB
            read_cache_max_size: 32 * 1024 * 1024,  // 32 MB
            read_ahead_batch_size: 100,
            entry_log_max_size: 1024 * 1024 * 1024, // 1 GB
            write_buffer_size: 64 * 1024,           // 64 KB
            alignment: 4096,
            buffer_pool_size: 16,
            gc_wait_time: Duration::ZERO, // disabled
            minor_compaction_threshold: 0.2,
            major_compaction_threshold: 0.8,
            major_compaction_every: 10,
            max_throttle_time: Duration::from_secs(10),
            entries_per_page: 8192,
        }
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a ledger directory.
    #[must_use]
    pub fn ledger_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_dirs.push(dir.into());
        self
    }

    /// Sets all ledger directories.
    #[must_use]
    pub fn ledger_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.ledger_dirs = dirs;
        self
    }

    /// Sets separate index directories.
    #[must_use]
    pub fn index_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.index_dirs = Some(dirs);
        self
    }

    /// Sets whether missing directories are created.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the storage engine.
    #[must_use]
    pub const fn storage_kind(mut self, kind: LedgerStorageKind) -> Self {
        self.storage_kind = kind;
        self
    }

    /// Sets the write cache size.
    #[must_use]
    pub const fn write_cache_max_size(mut self, size: u64) -> Self {
        self.write_cache_max_size = size;
        self
    }

    /// Sets the read cache size.
    #[must_use]
    pub const fn read_cache_max_size(mut self, size: u64) -> Self {
        self.read_cache_max_size = size;
        self
    }

    /// Sets the read-ahead batch size.
    #[must_use]
    pub const fn read_ahead_batch_size(mut self, entries: usize) -> Self {
        self.read_ahead_batch_size = entries;
        self
    }

    /// Sets the maximum entry log size.
    #[must_use]
    pub const fn entry_log_max_size(mut self, size: u64) -> Self {
        self.entry_log_max_size = size;
        self
    }

    /// Sets the write buffer size.
    #[must_use]
    pub const fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Sets the write alignment.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the number of write buffers.
    #[must_use]
    pub const fn buffer_pool_size(mut self, buffers: usize) -> Self {
        self.buffer_pool_size = buffers;
        self
    }

    /// Sets the garbage collection interval.
    #[must_use]
    pub const fn gc_wait_time(mut self, interval: Duration) -> Self {
        self.gc_wait_time = interval;
        self
    }

    /// Sets the minor and major compaction thresholds.
    #[must_use]
    pub const fn compaction_thresholds(mut self, minor: f64, major: f64) -> Self {
        self.minor_compaction_threshold = minor;
        self.major_compaction_threshold = major;
        self
    }

    /// Sets the write cache throttle time.
    #[must_use]
    pub const fn max_throttle_time(mut self, time: Duration) -> Self {
        self.max_throttle_time = time;
        self
    }

    /// Sets the interleaved index page size.
    #[must_use]
    pub const fn entries_per_page(mut self, entries: usize) -> Self {
        self.entries_per_page = entries;
        self
    }

    /// Index directory paired with ledger directory `index`.
    #[must_use]
    pub fn index_dir_for(&self, index: usize) -> Option<&PathBuf> {
        match &self.index_dirs {
            Some(dirs) => dirs.get(index),
            None => self.ledger_dirs.get(index),
        }
    }

    /// Checks that the configuration can be used to open storage.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.ledger_dirs.is_empty() {
            return Err(CoreError::invalid_config("no ledger directories"));
        }
        if let Some(index_dirs) = &self.index_dirs {
            if index_dirs.len() != self.ledger_dirs.len() {
                return Err(CoreError::invalid_config(format!(
                    "{} index directories for {} ledger directories",
                    index_dirs.len(),
                    self.ledger_dirs.len()
                )));
            }
        }
        if !self.alignment.is_power_of_two() || self.alignment > ENTRY_LOG_HEADER_SIZE {
            return Err(CoreError::invalid_config(format!(
                "alignment {} must be a power of two no larger than {ENTRY_LOG_HEADER_SIZE}",
                self.alignment
            )));
        }
        if self.write_buffer_size == 0 || self.write_buffer_size % self.alignment != 0 {
            return Err(CoreError::invalid_config(format!(
                "write buffer size {} is not a multiple of alignment {}",
                self.write_buffer_size, self.alignment
            )));
        }
        if self.buffer_pool_size == 0 {
            return Err(CoreError::invalid_config("buffer pool needs at least one buffer"));
        }
        if self.entry_log_max_size <= ENTRY_LOG_HEADER_SIZE as u64
            || self.entry_log_max_size > MAX_ENTRY_LOG_SIZE
        {
            return Err(CoreError::invalid_config(format!(
                "entry log size {} must be above {ENTRY_LOG_HEADER_SIZE} and at most {MAX_ENTRY_LOG_SIZE}",
                self.entry_log_max_size
            )));
        }
        if self.write_cache_max_size == 0 {
            return Err(CoreError::invalid_config("write cache size must be positive"));
        }
        for (name, value) in [
            ("minor", self.minor_compaction_threshold),
            ("major", self.major_compaction_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::invalid_config(format!(
                    "{name} compaction threshold {value} is outside [0, 1]"
                )));
            }
        }
        if self.entries_per_page == 0 {
            return Err(CoreError::invalid_config("index pages need at least one slot"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StorageConfig::default();
        assert!(config.create_if_missing);
        assert_eq!(config.storage_kind, LedgerStorageKind::Db);
        assert_eq!(config.gc_wait_time, Duration::ZERO);
        // No directories yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_pattern() {
        let config = StorageConfig::new()
            .ledger_dir("/data/1")
            .ledger_dir("/data/2")
            .write_cache_max_size(1024)
            .alignment(512)
            .write_buffer_size(2048)
            .storage_kind(LedgerStorageKind::Sorted);

        assert_eq!(config.ledger_dirs.len(), 2);
        assert_eq!(config.write_cache_max_size, 1024);
        assert_eq!(config.storage_kind, LedgerStorageKind::Sorted);
        assert!(config.validate().is_ok());
        assert_eq!(config.index_dir_for(1), Some(&PathBuf::from("/data/2")));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = StorageConfig::new().ledger_dir("/data");
        assert!(base.clone().alignment(3000).validate().is_err());
        assert!(base.clone().alignment(8192).validate().is_err());
        assert!(base.clone().write_buffer_size(1000).validate().is_err());
        assert!(base.clone().entry_log_max_size(1 << 40).validate().is_err());
        assert!(base.clone().compaction_thresholds(0.5, 1.5).validate().is_err());
        assert!(base
            .clone()
            .index_dirs(vec!["/a".into(), "/b".into()])
            .validate()
            .is_err());
        assert!(base.validate().is_ok());
    }

    #[test]
    fn storage_kind_parses() {
        assert_eq!("db".parse::<LedgerStorageKind>().unwrap(), LedgerStorageKind::Db);
        assert_eq!(
            "Interleaved".parse::<LedgerStorageKind>().unwrap(),
            LedgerStorageKind::Interleaved
        );
        assert!("rocks".parse::<LedgerStorageKind>().is_err());
        assert_eq!(LedgerStorageKind::Sorted.to_string(), "sorted");
    }
}
