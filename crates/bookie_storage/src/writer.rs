//! Aligned, buffered entry log writer.

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::{StorageError, StorageResult};
use crate::executor::SerialExecutor;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Filler written between the end of flushed data and the next alignment
/// boundary. A record never starts with this byte.
pub const PADDING_BYTE: u8 = 0xF0;

/// Largest payload [`LogWriter::write_delimited`] accepts. Keeps the first
/// byte of every size prefix distinct from [`PADDING_BYTE`].
const MAX_RECORD_LEN: usize = 0xEFFF_FFFF - 4;

/// Bytes a size-prefixed record of `len` payload bytes occupies in a log.
#[must_use]
pub const fn delimited_size(len: usize) -> usize {
    4 + len
}

/// Writer for a single entry log file.
pub trait LogWriter: Send + Sync {
    /// Id of the log being written.
    fn log_id(&self) -> u32;

    /// Writes `data` at `offset`, bypassing the record buffer.
    ///
    /// Both `offset` and `data.len()` must be multiples of the alignment.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends a 4-byte big-endian length followed by `data`, returning the
    /// offset of the length prefix.
    fn write_delimited(&self, data: &[u8]) -> StorageResult<u64>;

    /// Offset the next delimited record will be written at.
    fn position(&self) -> u64;

    /// Moves the record position. Only valid while nothing is buffered.
    fn set_position(&self, offset: u64) -> StorageResult<()>;

    /// Offset below which every byte is known to be on disk.
    fn flushed_position(&self) -> u64;

    /// Pads the buffered tail to alignment, writes it, and waits for every
    /// write submitted before this call.
    fn flush(&self) -> StorageResult<()>;

    /// Flushes and closes the writer. Later operations fail.
    fn close(&self) -> StorageResult<()>;
}

type WriteOutcome = Result<(), String>;

/// A [`LogWriter`] that hands aligned buffers to a [`SerialExecutor`].
///
/// Records accumulate in a pooled buffer. When the buffer fills it is
/// submitted to the executor and a fresh one is taken from the pool, so the
/// caller never waits on disk I/O except in [`LogWriter::flush`].
///
/// A flush queues an fsync job behind every write submitted before it and
/// waits for that job, so concurrent flushes each get the full barrier. The
/// first failed write poisons the writer: every later flush reports it.
pub struct DirectWriter {
    log_id: u32,
    path: PathBuf,
    max_file_size: u64,
    file: Arc<File>,
    executor: Arc<SerialExecutor>,
    pool: BufferPool,
    failure: Arc<Mutex<Option<String>>>,
    state: Mutex<WriterState>,
}

struct WriterState {
    buffer: Option<PooledBuffer>,
    buffer_offset: u64,
    flushed: u64,
    closed: bool,
}

impl DirectWriter {
    /// Creates a new log file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file already exists or cannot be created.
    pub fn create(
        log_id: u32,
        path: &Path,
        max_file_size: u64,
        executor: Arc<SerialExecutor>,
        pool: BufferPool,
    ) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        debug!(log_id, path = %path.display(), "created entry log");

        Ok(Self {
            log_id,
            path: path.to_path_buf(),
            max_file_size,
            file: Arc::new(file),
            executor,
            pool,
            failure: Arc::new(Mutex::new(None)),
            state: Mutex::new(WriterState {
                buffer: None,
                buffer_offset: 0,
                flushed: 0,
                closed: false,
            }),
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maximum size the log file may grow to.
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn check_alignment(&self, offset: u64, len: usize) -> StorageResult<()> {
        let alignment = self.pool.alignment();
        if offset % alignment as u64 != 0 || len % alignment != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len,
                alignment,
            });
        }
        Ok(())
    }

    fn check_limit(&self, offset: u64, len: usize) -> StorageResult<()> {
        if offset.saturating_add(len as u64) > self.max_file_size {
            return Err(StorageError::WriteBeyondLimit {
                offset,
                len,
                max_file_size: self.max_file_size,
            });
        }
        Ok(())
    }

    fn submit(&self, buffer: PooledBuffer, offset: u64) -> StorageResult<()> {
        let file = Arc::clone(&self.file);
        let failure = Arc::clone(&self.failure);
        let log_id = self.log_id;
        self.executor.execute(move || {
            if let Err(message) = write_buffer(&file, offset, &buffer) {
                warn!(log_id, %message, "entry log write failed");
                failure.lock().get_or_insert(message);
            }
        })
    }

    /// Submits the buffered tail and an fsync job behind it, then waits for
    /// the fsync with the state lock released.
    fn barrier(&self, mut state: MutexGuard<'_, WriterState>) -> StorageResult<()> {
        if let Some(mut buffer) = state.buffer.take() {
            if !buffer.is_empty() {
                let offset = state.buffer_offset;
                let padded = buffer.pad_to_alignment(PADDING_BYTE);
                state.buffer_offset += padded as u64;
                self.submit(buffer, offset)?;
            }
        }
        let target = state.buffer_offset;

        let file = Arc::clone(&self.file);
        let failure = Arc::clone(&self.failure);
        let synced = self.executor.submit(move || -> WriteOutcome {
            if let Some(message) = failure.lock().clone() {
                return Err(message);
            }
            file.sync_data().map_err(|e| format!("fsync: {e}"))
        })?;
        drop(state);

        synced.wait()?.map_err(StorageError::WriteFailed)?;
        let mut state = self.state.lock();
        state.flushed = state.flushed.max(target);
        Ok(())
    }

    fn append(&self, state: &mut WriterState, mut src: &[u8]) -> StorageResult<()> {
        while !src.is_empty() {
            let mut buffer = match state.buffer.take() {
                Some(buffer) => buffer,
                None => self.pool.acquire()?,
            };
            let taken = buffer.put_slice(src);
            src = &src[taken..];

            if buffer.is_full() {
                let offset = state.buffer_offset;
                state.buffer_offset += buffer.capacity() as u64;
                self.submit(buffer, offset)?;
            } else {
                state.buffer = Some(buffer);
            }
        }
        Ok(())
    }
}

fn write_buffer(file: &File, offset: u64, buffer: &PooledBuffer) -> WriteOutcome {
    let mut file = file;
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(buffer.as_slice()))
        .map_err(|e| format!("write of {} bytes at {offset}: {e}", buffer.len()))
}

impl LogWriter for DirectWriter {
    fn log_id(&self) -> u32 {
        self.log_id
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        self.check_alignment(offset, data.len())?;
        self.check_limit(offset, data.len())?;

        let chunk_size = self.pool.buffer_size();
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let mut buffer = self.pool.acquire()?;
            buffer.put_slice(chunk);
            let chunk_offset = offset + (i * chunk_size) as u64;
            self.submit(buffer, chunk_offset)?;
        }
        Ok(())
    }

    fn write_delimited(&self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }

        let position = state.buffer_offset + state.buffer.as_ref().map_or(0, |b| b.len() as u64);
        let total = delimited_size(data.len());
        if data.len() > MAX_RECORD_LEN {
            return Err(StorageError::WriteBeyondLimit {
                offset: position,
                len: total,
                max_file_size: self.max_file_size,
            });
        }
        self.check_limit(position, total)?;

        let len = (data.len() as u32).to_be_bytes();
        self.append(&mut state, &len)?;
        self.append(&mut state, data)?;
        Ok(position)
    }

    fn position(&self) -> u64 {
        let state = self.state.lock();
        state.buffer_offset + state.buffer.as_ref().map_or(0, |b| b.len() as u64)
    }

    fn set_position(&self, offset: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        self.check_alignment(offset, 0)?;
        if state.buffer.as_ref().is_some_and(|b| !b.is_empty()) {
            return Err(StorageError::WriteFailed(
                "cannot move the position of a writer holding buffered records".into(),
            ));
        }
        state.buffer_offset = offset;
        Ok(())
    }

    fn flushed_position(&self) -> u64 {
        self.state.lock().flushed
    }

    fn flush(&self) -> StorageResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        self.barrier(state)
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let flushed = self.barrier(state);
        debug!(log_id = self.log_id, "closed entry log writer");
        flushed
    }
}

impl fmt::Debug for DirectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectWriter")
            .field("log_id", &self.log_id)
            .field("path", &self.path)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}
