//! # Bookie Core
//!
//! Ledger storage engine of a bookie.
//!
//! This crate provides:
//! - [`LedgerStorage`] - the storage contract used by request processing
//! - [`DbLedgerStorage`] - routes ledgers over one
//!   [`SingleDirectoryDbLedgerStorage`] per configured ledger directory
//! - [`InterleavedLedgerStorage`] and [`SortedLedgerStorage`] - single
//!   directory engines with a paged entry index
//! - [`EntryLogger`] - append-only entry logs written through
//!   [`bookie_storage::DirectWriter`]
//! - [`LedgerDescriptor`] - per-ledger access control and fencing
//! - [`GarbageCollector`] - deletion of inactive ledgers and entry log
//!   compaction
//!
//! ## Example
//!
//! ```rust,no_run
//! use bookie_core::{open_ledger_storage, StorageConfig};
//! use bytes::Bytes;
//!
//! let config = StorageConfig::new().ledger_dir("/var/lib/bookie/ledgers");
//! let storage = open_ledger_storage(&config).unwrap();
//!
//! let mut entry = Vec::new();
//! entry.extend_from_slice(&1i64.to_be_bytes());
//! entry.extend_from_slice(&0i64.to_be_bytes());
//! entry.extend_from_slice(b"payload");
//! storage.set_master_key(1, b"key").unwrap();
//! storage.add_entry(Bytes::from(entry)).unwrap();
//! storage.flush().unwrap();
//! storage.shutdown().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
mod config;
mod descriptor;
pub mod dirs;
mod entrylog;
mod error;
pub mod gc;
pub mod index;
pub mod journal;
pub mod kv;
pub mod storage;
mod types;

pub use config::{LedgerStorageKind, StorageConfig, ENTRY_LOG_HEADER_SIZE, MAX_ENTRY_LOG_SIZE};
pub use descriptor::LedgerDescriptor;
pub use entrylog::{
    scan_log_bytes, EntryLogger, EntryLoggerConfig, ScannedEntry, LOG_MAGIC, LOG_VERSION,
};
pub use error::{CoreError, CoreResult};
pub use gc::{GarbageCollector, GcStats, LedgerManager};
pub use journal::{
    FenceCompletion, FenceRecords, FenceSlot, InMemoryJournal, Journal, JournalError,
};
pub use storage::{
    open_ledger_storage, open_ledger_storage_with, DbLedgerStorage, InterleavedLedgerStorage,
    LedgerStorage, SingleDirectoryDbLedgerStorage, SortedLedgerStorage,
};
pub use types::{
    parse_entry_ids, parse_last_add_confirmed, validate_ledger_id, EntryLocation, LogLocation,
    StorageStateFlag, ENTRY_ID_HEADER_SIZE, ENTRY_LAC_HEADER_SIZE, LAST_ADD_CONFIRMED,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
