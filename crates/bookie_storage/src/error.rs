//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored bytes do not have the expected shape.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The writer or backend has been closed.
    #[error("storage is closed")]
    Closed,

    /// A direct write did not respect the configured alignment.
    #[error("misaligned write: offset {offset}, len {len}, alignment {alignment}")]
    Misaligned {
        /// The requested file offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The alignment the writer enforces.
        alignment: usize,
    },

    /// A write would grow the log file beyond its maximum size.
    #[error("write of {len} bytes at offset {offset} exceeds max file size {max_file_size}")]
    WriteBeyondLimit {
        /// The requested file offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The configured maximum file size.
        max_file_size: u64,
    },

    /// Buffer pool parameters are unusable.
    #[error("invalid buffer pool configuration: {0}")]
    InvalidPoolConfig(String),

    /// The buffer pool was closed while a buffer was requested.
    #[error("buffer pool is closed")]
    PoolClosed,

    /// A write submitted to the writer thread failed.
    #[error("background write failed: {0}")]
    WriteFailed(String),

    /// The executor no longer accepts work, or dropped a job unfinished.
    #[error("executor {0} is shut down")]
    ExecutorShutDown(String),

    /// A file name does not follow the entry log naming scheme.
    #[error("not an entry log file name: {0}")]
    InvalidLogFileName(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true for alignment violations.
    #[must_use]
    pub fn is_misaligned(&self) -> bool {
        matches!(self, Self::Misaligned { .. })
    }
}
