//! Storage directory management.
//!
//! Every ledger and index directory has the same layout:
//!
//! ```text
//! <root>/
//! └─ current/
//!    ├─ LOCK            # Advisory lock, one engine per directory
//!    ├─ <hex id>.log    # Entry logs (ledger directories)
//!    ├─ locations.kv    # Entry location index (index directories)
//!    ├─ ledgers.kv      # Ledger metadata index (index directories)
//!    └─ pages.kv        # Paged entry index (interleaved engine)
//! ```
//!
//! When no separate index directory is configured, the index files live next
//! to the entry logs.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the subdirectory holding the files of a storage directory.
pub const CURRENT_DIR: &str = "current";

const LOCK_FILE: &str = "LOCK";
const LOCATIONS_FILE: &str = "locations.kv";
const LEDGERS_FILE: &str = "ledgers.kv";
const PAGES_FILE: &str = "pages.kv";

/// A storage directory with its `current` subdirectory locked for exclusive
/// use.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct LedgerDir {
    root: PathBuf,
    current: PathBuf,
    _lock_file: File,
}

impl LedgerDir {
    /// Checks or creates the directory structure and takes the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - The path is not a directory
    /// - Another process holds the lock (returns `DirectoryLocked`)
    pub fn open(root: &Path, create_if_missing: bool) -> CoreResult<Self> {
        let current = current_dir(root);
        if !current.exists() {
            if create_if_missing {
                fs::create_dir_all(&current)?;
            } else {
                return Err(CoreError::invalid_config(format!(
                    "storage directory does not exist: {}",
                    current.display()
                )));
            }
        }
        if !current.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "path is not a directory: {}",
                current.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(current.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirectoryLocked { path: current });
        }

        Ok(Self {
            root: root.to_path_buf(),
            current,
            _lock_file: lock_file,
        })
    }

    /// The configured root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `current` subdirectory.
    #[must_use]
    pub fn current(&self) -> &Path {
        &self.current
    }

    /// Path of the entry location index.
    #[must_use]
    pub fn locations_path(&self) -> PathBuf {
        locations_path(&self.root)
    }

    /// Path of the ledger metadata index.
    #[must_use]
    pub fn ledgers_path(&self) -> PathBuf {
        ledgers_path(&self.root)
    }

    /// Path of the paged entry index.
    #[must_use]
    pub fn pages_path(&self) -> PathBuf {
        current_dir(&self.root).join(PAGES_FILE)
    }
}

/// The `current` subdirectory of a storage directory.
#[must_use]
pub fn current_dir(root: &Path) -> PathBuf {
    root.join(CURRENT_DIR)
}

/// Path of the entry location index under an index directory.
#[must_use]
pub fn locations_path(index_root: &Path) -> PathBuf {
    current_dir(index_root).join(LOCATIONS_FILE)
}

/// Path of the ledger metadata index under an index directory.
#[must_use]
pub fn ledgers_path(index_root: &Path) -> PathBuf {
    current_dir(index_root).join(LEDGERS_FILE)
}

/// The locked directories of one storage engine.
#[derive(Debug)]
pub struct LedgerDirs {
    ledger: LedgerDir,
    index: Option<LedgerDir>,
}

impl LedgerDirs {
    /// Opens the ledger directory and, when it differs, the index directory.
    ///
    /// # Errors
    ///
    /// Fails if either directory cannot be opened or locked.
    pub fn open(ledger_root: &Path, index_root: &Path, create_if_missing: bool) -> CoreResult<Self> {
        let ledger = LedgerDir::open(ledger_root, create_if_missing)?;
        let index = if index_root == ledger_root {
            None
        } else {
            Some(LedgerDir::open(index_root, create_if_missing)?)
        };
        Ok(Self { ledger, index })
    }

    /// Directory holding the entry logs.
    #[must_use]
    pub fn ledger_dir(&self) -> &LedgerDir {
        &self.ledger
    }

    /// Directory holding the index files.
    #[must_use]
    pub fn index_dir(&self) -> &LedgerDir {
        self.index.as_ref().unwrap_or(&self.ledger)
    }
}
