//! Entry log file naming.
//!
//! A log with id `n` lives in `<dir>/<lowercase hex of n>.log`.

use crate::error::{StorageError, StorageResult};
use std::path::{Path, PathBuf};

/// File extension of entry log files.
pub const LOG_FILE_EXTENSION: &str = "log";

/// Path of the entry log with id `log_id` inside `dir`.
#[must_use]
pub fn log_filename(dir: &Path, log_id: u32) -> PathBuf {
    dir.join(format!("{log_id:x}.{LOG_FILE_EXTENSION}"))
}

/// Parses the log id out of an entry log path.
///
/// Returns `None` for anything that is not `<hex>.log`.
#[must_use]
pub fn parse_log_id(path: &Path) -> Option<u32> {
    if path.extension()?.to_str()? != LOG_FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}

/// Lists the ids of all entry logs in `dir`, in ascending order.
///
/// A missing directory holds no logs.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_log_ids(dir: &Path) -> StorageResult<Vec<u32>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if let Some(id) = parse_log_id(&path) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
