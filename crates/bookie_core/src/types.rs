//! Core type definitions for ledger storage.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry id sentinel meaning "the last entry written to the ledger".
pub const LAST_ADD_CONFIRMED: i64 = -1;

/// Size of the `(ledgerId, entryId)` header every entry starts with.
pub const ENTRY_ID_HEADER_SIZE: usize = 16;

/// Size of the header when it also carries the producer's last add
/// confirmed.
pub const ENTRY_LAC_HEADER_SIZE: usize = 24;

/// Position of an entry in the entry logs.
///
/// Packs the log id in the upper 32 bits and the byte offset of the record
/// in the lower 32 bits. The value `0` never addresses a record because
/// every log starts with a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogLocation(u64);

impl LogLocation {
    /// Creates a location from a log id and offset.
    #[must_use]
    pub const fn new(log_id: u32, offset: u32) -> Self {
        Self(((log_id as u64) << 32) | offset as u64)
    }

    /// Reconstructs a location from its packed form.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the packed form.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Id of the log holding the entry.
    #[must_use]
    pub const fn log_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Byte offset of the record within the log.
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for LogLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.log@{}", self.log_id(), self.offset())
    }
}

/// An index entry: where one entry of one ledger lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Ledger of the entry.
    pub ledger_id: i64,
    /// Entry id within the ledger.
    pub entry_id: i64,
    /// Location of the entry record.
    pub location: LogLocation,
}

impl EntryLocation {
    /// Creates an index entry.
    #[must_use]
    pub const fn new(ledger_id: i64, entry_id: i64, location: LogLocation) -> Self {
        Self {
            ledger_id,
            entry_id,
            location,
        }
    }
}

/// Persistent flags describing the state of the storage as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageStateFlag {
    /// The index must be checked against the entry logs before it is
    /// trusted.
    NeedsIntegrityCheck,
}

impl fmt::Display for StorageStateFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeedsIntegrityCheck => f.write_str("needs-integrity-check"),
        }
    }
}

/// Rejects negative ledger ids.
///
/// # Errors
///
/// Returns [`CoreError::InvalidLedgerId`].
pub fn validate_ledger_id(ledger_id: i64) -> CoreResult<()> {
    if ledger_id < 0 {
        return Err(CoreError::InvalidLedgerId { ledger_id });
    }
    Ok(())
}

/// Reads the `(ledgerId, entryId)` header of an entry and validates it.
///
/// A last add confirmed, when present, may be [`LAST_ADD_CONFIRMED`] (the
/// value carried by entry 0) but nothing lower.
///
/// # Errors
///
/// Fails if the buffer is shorter than the header, either id is negative,
/// or the last add confirmed is below `-1`.
pub fn parse_entry_ids(entry: &[u8]) -> CoreResult<(i64, i64)> {
    if entry.len() < ENTRY_ID_HEADER_SIZE {
        return Err(CoreError::invalid_entry(format!(
            "entry of {} bytes is shorter than the {ENTRY_ID_HEADER_SIZE} byte header",
            entry.len()
        )));
    }
    let ledger_id = read_i64(entry, 0);
    let entry_id = read_i64(entry, 8);
    validate_ledger_id(ledger_id)?;
    if entry_id < 0 {
        return Err(CoreError::InvalidEntryId {
            ledger_id,
            entry_id,
        });
    }
    if let Some(lac) = parse_last_add_confirmed(entry).filter(|&lac| lac < LAST_ADD_CONFIRMED) {
        return Err(CoreError::invalid_entry(format!(
            "entry {ledger_id}:{entry_id} carries last add confirmed {lac}"
        )));
    }
    Ok((ledger_id, entry_id))
}

/// Reads the last add confirmed carried by an entry, if it has one.
#[must_use]
pub fn parse_last_add_confirmed(entry: &[u8]) -> Option<i64> {
    (entry.len() >= ENTRY_LAC_HEADER_SIZE).then(|| read_i64(entry, 16))
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_be_bytes(bytes)
}
