//! Append-only entry logs.
//!
//! Entries are appended to the current log through a [`DirectWriter`]. When
//! the next record would push the log past the configured maximum size, the
//! log is closed and a new one with the next id is started.
//!
//! ## File layout
//!
//! ```text
//! <dir>/<hex log id>.log
//!
//! header block (4 KiB):  magic "BKLG" | version u32 BE | log id u32 BE |
//!                        alignment u32 BE | zero fill
//! records:               size u32 BE | entry bytes
//! padding:               0xF0 up to the next alignment boundary after
//!                        every flush
//! ```

use crate::config::{StorageConfig, ENTRY_LOG_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::types::LogLocation;
use bookie_storage::{
    delimited_size, list_log_ids, log_filename, BufferPool, DirectWriter, LogWriter,
    SerialExecutor, StorageError, PADDING_BYTE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes at the start of every entry log.
pub const LOG_MAGIC: [u8; 4] = *b"BKLG";

/// Current entry log format version.
pub const LOG_VERSION: u32 = 1;

/// Sizing of an [`EntryLogger`].
#[derive(Debug, Clone, Copy)]
pub struct EntryLoggerConfig {
    /// Maximum size of one log file.
    pub max_file_size: u64,
    /// Size of each write buffer.
    pub write_buffer_size: usize,
    /// Alignment of every write.
    pub alignment: usize,
    /// Number of write buffers.
    pub buffer_pool_size: usize,
}

impl From<&StorageConfig> for EntryLoggerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_file_size: config.entry_log_max_size,
            write_buffer_size: config.write_buffer_size,
            alignment: config.alignment,
            buffer_pool_size: config.buffer_pool_size,
        }
    }
}

/// An entry found while scanning a log.
#[derive(Debug, Clone, Copy)]
pub struct ScannedEntry<'a> {
    /// Ledger id from the entry header.
    pub ledger_id: i64,
    /// Entry id from the entry header.
    pub entry_id: i64,
    /// Where the record starts.
    pub location: LogLocation,
    /// The entry bytes.
    pub data: &'a [u8],
}

impl ScannedEntry<'_> {
    /// Bytes the record occupies in the log, size prefix included.
    #[must_use]
    pub fn record_size(&self) -> u64 {
        delimited_size(self.data.len()) as u64
    }
}

/// Writes entries to rotating log files and reads them back by location.
pub struct EntryLogger {
    dir: PathBuf,
    config: EntryLoggerConfig,
    executor: Arc<SerialExecutor>,
    pool: BufferPool,
    current: Mutex<CurrentLog>,
    readers: Mutex<HashMap<u32, File>>,
    closed: AtomicBool,
}

struct CurrentLog {
    writer: Option<Arc<DirectWriter>>,
    next_log_id: u32,
}

impl EntryLogger {
    /// Opens the logger for `dir`, creating the directory if needed.
    ///
    /// New entries go to a fresh log whose id follows the highest existing
    /// one; existing logs are only read.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or listed, or the writer
    /// thread cannot be started.
    pub fn open(dir: &Path, config: EntryLoggerConfig) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;
        let existing = list_log_ids(dir)?;
        let next_log_id = match existing.last() {
            Some(&last) => last
                .checked_add(1)
                .ok_or_else(|| CoreError::corruption("entry log ids exhausted"))?,
            None => 0,
        };

        let pool = BufferPool::new(
            config.alignment,
            config.write_buffer_size,
            config.buffer_pool_size,
        )?;
        let executor = Arc::new(SerialExecutor::new("bookie-log-writer")?);
        info!(dir = %dir.display(), logs = existing.len(), next_log_id, "opened entry logger");

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            executor,
            pool,
            current: Mutex::new(CurrentLog {
                writer: None,
                next_log_id,
            }),
            readers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the logs.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The writer thread shared by every log of this logger.
    #[must_use]
    pub fn executor(&self) -> &Arc<SerialExecutor> {
        &self.executor
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::ShutDown);
        }
        Ok(())
    }

    /// Appends an entry and returns where it was written.
    ///
    /// The entry is durable only after the next [`EntryLogger::flush`].
    ///
    /// # Errors
    ///
    /// Fails if the entry can never fit in a log, or the write fails.
    pub fn add_entry(&self, ledger_id: i64, entry: &[u8]) -> CoreResult<LogLocation> {
        self.check_open()?;
        let record = delimited_size(entry.len()) as u64;
        if ENTRY_LOG_HEADER_SIZE as u64 + record > self.config.max_file_size {
            return Err(CoreError::invalid_entry(format!(
                "entry of {} bytes for ledger {ledger_id} exceeds the entry log size",
                entry.len()
            )));
        }

        let mut current = self.current.lock();
        let reusable = current
            .writer
            .as_ref()
            .filter(|w| w.position() + record <= self.config.max_file_size)
            .cloned();
        let writer = match reusable {
            Some(writer) => writer,
            None => self.rotate(&mut current)?,
        };
        let offset = writer.write_delimited(entry)?;
        let offset = u32::try_from(offset)
            .map_err(|_| CoreError::corruption(format!("entry log offset {offset} out of range")))?;
        Ok(LogLocation::new(writer.log_id(), offset))
    }

    fn rotate(&self, current: &mut CurrentLog) -> CoreResult<Arc<DirectWriter>> {
        if let Some(old) = current.writer.take() {
            old.close()?;
            info!(log_id = old.log_id(), "rotated entry log");
        }

        let log_id = current.next_log_id;
        current.next_log_id = log_id
            .checked_add(1)
            .ok_or_else(|| CoreError::corruption("entry log ids exhausted"))?;

        let writer = DirectWriter::create(
            log_id,
            &log_filename(&self.dir, log_id),
            self.config.max_file_size,
            Arc::clone(&self.executor),
            self.pool.clone(),
        )?;
        writer.write_at(0, &encode_header(log_id, self.config.alignment))?;
        writer.set_position(ENTRY_LOG_HEADER_SIZE as u64)?;
        debug!(log_id, "started entry log");

        let writer = Arc::new(writer);
        current.writer = Some(Arc::clone(&writer));
        Ok(writer)
    }

    /// Id of the log currently written to.
    #[must_use]
    pub fn current_log_id(&self) -> Option<u32> {
        self.current.lock().writer.as_ref().map(|w| w.log_id())
    }

    /// Makes every entry added so far durable.
    ///
    /// # Errors
    ///
    /// Fails if a write or the sync fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.check_open()?;
        let writer = self.current.lock().writer.clone();
        if let Some(writer) = writer {
            flush_writer(&writer)?;
        }
        Ok(())
    }

    fn ensure_flushed(&self, location: LogLocation) -> CoreResult<()> {
        let writer = {
            let current = self.current.lock();
            match &current.writer {
                Some(w)
                    if w.log_id() == location.log_id()
                        && u64::from(location.offset()) >= w.flushed_position() =>
                {
                    Arc::clone(w)
                }
                _ => return Ok(()),
            }
        };
        debug!(%location, "flushing entry log to read unflushed entry");
        flush_writer(&writer)
    }

    /// Reads the raw record at `location`.
    ///
    /// # Errors
    ///
    /// Fails if the log is missing or the record is damaged.
    pub fn read_record(&self, location: LogLocation) -> CoreResult<Vec<u8>> {
        self.check_open()?;
        self.ensure_flushed(location)?;

        let log_id = location.log_id();
        let mut readers = self.readers.lock();
        let file = match readers.entry(log_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let path = log_filename(&self.dir, log_id);
                let file = File::open(&path).map_err(|err| {
                    CoreError::corruption(format!("cannot open {}: {err}", path.display()))
                })?;
                e.insert(file)
            }
        };

        file.seek(SeekFrom::Start(u64::from(location.offset())))?;
        let mut size = [0u8; 4];
        file.read_exact(&mut size)?;
        let size = u32::from_be_bytes(size) as u64;
        if size == 0 || size > self.config.max_file_size {
            return Err(CoreError::corruption(format!(
                "bad record size {size} at {location}"
            )));
        }
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Reads an entry and checks that it is the one expected.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Corruption`] if the record holds another
    /// entry.
    pub fn read_entry(
        &self,
        ledger_id: i64,
        entry_id: i64,
        location: LogLocation,
    ) -> CoreResult<Bytes> {
        let data = self.read_record(location)?;
        match entry_header(&data) {
            Some((l, e)) if l == ledger_id && e == entry_id => Ok(Bytes::from(data)),
            Some((l, e)) => Err(CoreError::corruption(format!(
                "expected entry {ledger_id}:{entry_id} at {location}, found {l}:{e}"
            ))),
            None => Err(CoreError::corruption(format!(
                "record at {location} is too short to be an entry"
            ))),
        }
    }

    /// Visits every entry of a log in file order. Returns the number of
    /// entries visited.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be read, its header is damaged, or the
    /// visitor fails.
    pub fn scan_entry_log<F>(&self, log_id: u32, mut visitor: F) -> CoreResult<usize>
    where
        F: FnMut(ScannedEntry<'_>) -> CoreResult<()>,
    {
        self.check_open()?;
        if self.current_log_id() == Some(log_id) {
            self.flush()?;
        }
        let data = fs::read(log_filename(&self.dir, log_id))?;
        scan_log_bytes(log_id, &data, &mut visitor)
    }

    /// Ids of every log in the directory, ascending.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be listed.
    pub fn log_ids(&self) -> CoreResult<Vec<u32>> {
        Ok(list_log_ids(&self.dir)?)
    }

    /// Size of a log file in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing.
    pub fn log_size(&self, log_id: u32) -> CoreResult<u64> {
        Ok(fs::metadata(log_filename(&self.dir, log_id))?.len())
    }

    /// Deletes a log that is no longer referenced.
    ///
    /// # Errors
    ///
    /// Refuses to remove the log currently written to.
    pub fn remove_entry_log(&self, log_id: u32) -> CoreResult<()> {
        self.check_open()?;
        if self.current_log_id() == Some(log_id) {
            return Err(CoreError::operation_rejected(format!(
                "entry log {log_id:x} is being written"
            )));
        }
        self.readers.lock().remove(&log_id);
        fs::remove_file(log_filename(&self.dir, log_id))?;
        info!(log_id, "removed entry log");
        Ok(())
    }

    /// Flushes and closes the current log and stops the writer thread.
    ///
    /// # Errors
    ///
    /// Fails if the final flush fails.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let writer = self.current.lock().writer.take();
        let result = match writer {
            Some(writer) => writer.close().map_err(CoreError::from),
            None => Ok(()),
        };
        self.executor.shutdown();
        self.pool.close();
        self.readers.lock().clear();
        info!(dir = %self.dir.display(), "closed entry logger");
        result
    }
}

impl fmt::Debug for EntryLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryLogger")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("current_log_id", &self.current_log_id())
            .finish_non_exhaustive()
    }
}

/// A writer closed by rotation has already flushed everything it held.
fn flush_writer(writer: &DirectWriter) -> CoreResult<()> {
    match writer.flush() {
        Ok(()) | Err(StorageError::Closed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn encode_header(log_id: u32, alignment: usize) -> Vec<u8> {
    let mut header = vec![0u8; ENTRY_LOG_HEADER_SIZE];
    header[0..4].copy_from_slice(&LOG_MAGIC);
    header[4..8].copy_from_slice(&LOG_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&log_id.to_be_bytes());
    header[12..16].copy_from_slice(&(alignment as u32).to_be_bytes());
    header
}

fn entry_header(data: &[u8]) -> Option<(i64, i64)> {
    let ledger_id = i64::from_be_bytes(data.get(0..8)?.try_into().ok()?);
    let entry_id = i64::from_be_bytes(data.get(8..16)?.try_into().ok()?);
    Some((ledger_id, entry_id))
}

/// Walks the records of a log image.
///
/// A torn record at the end of the log ends the scan.
pub fn scan_log_bytes<F>(log_id: u32, data: &[u8], visitor: &mut F) -> CoreResult<usize>
where
    F: FnMut(ScannedEntry<'_>) -> CoreResult<()>,
{
    if data.len() < ENTRY_LOG_HEADER_SIZE || data[0..4] != LOG_MAGIC {
        return Err(CoreError::corruption(format!(
            "entry log {log_id:x} has no valid header"
        )));
    }
    let header_u32 = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let version = header_u32(4);
    if version != LOG_VERSION {
        return Err(CoreError::corruption(format!(
            "entry log {log_id:x} has unsupported version {version}"
        )));
    }
    if header_u32(8) != log_id {
        return Err(CoreError::corruption(format!(
            "entry log {log_id:x} claims id {:x}",
            header_u32(8)
        )));
    }
    let alignment = header_u32(12) as usize;
    if !alignment.is_power_of_two() {
        return Err(CoreError::corruption(format!(
            "entry log {log_id:x} has bad alignment {alignment}"
        )));
    }

    let mut pos = ENTRY_LOG_HEADER_SIZE;
    let mut visited = 0;
    while pos + 4 <= data.len() {
        if data[pos] == PADDING_BYTE {
            pos = (pos / alignment + 1) * alignment;
            continue;
        }
        let size = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        if size == 0 {
            break;
        }
        let end = pos + 4 + size;
        if end > data.len() {
            warn!(log_id, offset = pos, size, "entry log ends with a torn record");
            break;
        }

        let entry = &data[pos + 4..end];
        let (ledger_id, entry_id) = entry_header(entry).ok_or_else(|| {
            CoreError::corruption(format!(
                "record of {size} bytes at {log_id:x}.log@{pos} is too short to be an entry"
            ))
        })?;
        visitor(ScannedEntry {
            ledger_id,
            entry_id,
            location: LogLocation::new(log_id, pos as u32),
            data: entry,
        })?;
        visited += 1;
        pos = end;
    }
    Ok(visited)
}
