//! # Bookie Storage
//!
//! Byte-level storage primitives for the bookie ledger storage engine.
//!
//! This crate knows nothing about ledgers, entries or indexes. It provides:
//!
//! - [`StorageBackend`] - append-only byte stores ([`FileBackend`],
//!   [`InMemoryBackend`]) used for the key-value operation logs
//! - [`BufferPool`] - a fixed set of reusable, alignment-sized buffers
//! - [`SerialExecutor`] and [`Completion`] - a single writer thread and the
//!   poll-able completion handle returned for work submitted to it
//! - [`LogWriter`] / [`DirectWriter`] - an aligned, buffered writer for one
//!   entry log file whose disk writes all go through one writer thread
//! - [`log_filename`] / [`parse_log_id`] - deterministic entry log naming
//!
//! ## Example
//!
//! ```rust
//! use bookie_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod buffer;
mod error;
mod executor;
mod file;
mod memory;
mod naming;
mod writer;

pub use backend::StorageBackend;
pub use buffer::{BufferPool, PooledBuffer};
pub use error::{StorageError, StorageResult};
pub use executor::{Completer, Completion, SerialExecutor};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use naming::{list_log_ids, log_filename, parse_log_id, LOG_FILE_EXTENSION};
pub use writer::{delimited_size, DirectWriter, LogWriter, PADDING_BYTE};

/// Default alignment for direct I/O writes (4 KiB).
pub const DEFAULT_ALIGNMENT: usize = 4096;
