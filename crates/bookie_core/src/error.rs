//! Error types for the ledger storage engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ledger storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] bookie_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Ledger ids must be non-negative.
    #[error("invalid ledger id {ledger_id}")]
    InvalidLedgerId {
        /// The rejected ledger id.
        ledger_id: i64,
    },

    /// Entry ids must be non-negative (or the last-add-confirmed sentinel
    /// where a read accepts it).
    #[error("invalid entry id {entry_id} for ledger {ledger_id}")]
    InvalidEntryId {
        /// The ledger addressed.
        ledger_id: i64,
        /// The rejected entry id.
        entry_id: i64,
    },

    /// An entry buffer is malformed.
    #[error("invalid entry: {message}")]
    InvalidEntry {
        /// Description of the problem.
        message: String,
    },

    /// An entry was added through a descriptor of another ledger.
    #[error("entry belongs to ledger {actual}, descriptor is for ledger {expected}")]
    LedgerIdMismatch {
        /// Ledger id of the descriptor.
        expected: i64,
        /// Ledger id found in the entry.
        actual: i64,
    },

    /// A location update addressed ledgers of more than one directory.
    #[error("location update spans {directories} ledger directories")]
    SplitLocationBatch {
        /// Number of directories the batch touched.
        directories: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A different master key is already registered for the ledger.
    #[error("master key mismatch for ledger {ledger_id}")]
    MasterKeyMismatch {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The presented key does not grant access to the ledger.
    #[error("unauthorized access to ledger {ledger_id}")]
    UnauthorizedAccess {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The ledger is unknown.
    #[error("no such ledger {ledger_id}")]
    NoLedger {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The ledger is known but the entry is not.
    #[error("no such entry {entry_id} in ledger {ledger_id}")]
    NoEntry {
        /// The ledger addressed.
        ledger_id: i64,
        /// The entry addressed.
        entry_id: i64,
    },

    /// The ledger is in limbo and the answer cannot be given from local data.
    #[error("ledger {ledger_id} is in limbo, data unknown")]
    DataUnknown {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The ledger is fenced and rejects new entries.
    #[error("ledger {ledger_id} is fenced")]
    LedgerFenced {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The descriptor was opened read-only.
    #[error("ledger {ledger_id} was opened read-only")]
    ReadOnly {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// The storage has been shut down.
    #[error("ledger storage is shut down")]
    ShutDown,

    /// The write cache stayed full for longer than the throttle time.
    #[error("operation rejected: {message}")]
    OperationRejected {
        /// Description of the rejection.
        message: String,
    },

    /// The storage implementation does not support the operation.
    #[error("{operation} is not supported by this ledger storage")]
    Unsupported {
        /// Name of the operation.
        operation: &'static str,
    },

    /// Fencing needs a journal to record the fence, and none was supplied.
    #[error("no journal available to record fencing of ledger {ledger_id}")]
    JournalUnavailable {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// A page source produced no pages.
    #[error("no index pages supplied for ledger {ledger_id}")]
    EmptyPages {
        /// The ledger addressed.
        ledger_id: i64,
    },

    /// A page source failed to produce a page.
    #[error("failed to materialize index page of ledger {ledger_id}: {message}")]
    PageMaterialization {
        /// The ledger addressed.
        ledger_id: i64,
        /// Description of the failure.
        message: String,
    },

    /// On-disk data is damaged.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A record checksum did not match.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Ledger metadata could not be encoded or decoded.
    #[error("metadata codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Another process holds the directory lock.
    #[error("directory locked by another process: {}", path.display())]
    DirectoryLocked {
        /// The locked directory.
        path: PathBuf,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid entry error.
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            message: message.into(),
        }
    }

    /// Creates an operation rejected error.
    pub fn operation_rejected(message: impl Into<String>) -> Self {
        Self::OperationRejected {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Returns true for `NoLedger` and `NoEntry`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoLedger { .. } | Self::NoEntry { .. })
    }

    /// Returns true for rejected arguments.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidLedgerId { .. }
                | Self::InvalidEntryId { .. }
                | Self::InvalidEntry { .. }
                | Self::LedgerIdMismatch { .. }
                | Self::SplitLocationBatch { .. }
                | Self::InvalidConfig { .. }
        )
    }

    /// Returns true for key conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::MasterKeyMismatch { .. } | Self::UnauthorizedAccess { .. }
        )
    }

    /// Returns true if the answer depends on data this bookie may not hold.
    #[must_use]
    pub fn is_data_unknown(&self) -> bool {
        matches!(self, Self::DataUnknown { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CoreError::NoLedger { ledger_id: 1 }.is_not_found());
        assert!(CoreError::NoEntry {
            ledger_id: 1,
            entry_id: 2
        }
        .is_not_found());
        assert!(!CoreError::DataUnknown { ledger_id: 1 }.is_not_found());
        assert!(CoreError::DataUnknown { ledger_id: 1 }.is_data_unknown());
        assert!(CoreError::InvalidLedgerId { ledger_id: -1 }.is_validation());
        assert!(CoreError::MasterKeyMismatch { ledger_id: 3 }.is_conflict());
        assert!(!CoreError::ShutDown.is_validation());
    }

    #[test]
    fn messages_name_the_ledger() {
        let err = CoreError::LedgerFenced { ledger_id: 42 };
        assert_eq!(err.to_string(), "ledger 42 is fenced");

        let err = CoreError::NoEntry {
            ledger_id: 7,
            entry_id: 9,
        };
        assert_eq!(err.to_string(), "no such entry 9 in ledger 7");
    }
}
