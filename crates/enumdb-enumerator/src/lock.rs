//! Exclusive ownership of an enumerator's files.

use enumdb_common::{Result, StorageError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// OS-level lock on `<base>.lock`.
///
/// Locks belong to the open file handle, so a second open of the same base,
/// from this process or another, fails with `AlreadyInUse` while this one is
/// held. The OS drops the lock if the process dies; a leftover file with a
/// stale pid does not block anyone.
pub(crate) struct StorageLock {
    path: PathBuf,
    file: Option<File>,
}

impl StorageLock {
    pub fn acquire(path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                StorageError::AlreadyInUse { path: path.clone() }
            } else {
                StorageError::Io(e)
            }
        })?;

        // The pid is informational only
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "acquired storage lock");

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock and removes the lock file.
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
            drop(file);
            std::fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "released storage lock");
        }
        Ok(())
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}
