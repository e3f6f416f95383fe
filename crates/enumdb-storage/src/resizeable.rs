//! Growth-aware file with a persisted logical length.

use crate::storage::ByteStorage;
use enumdb_common::{Result, StorageError};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the `.len` sidecar file.
const LEN_FILE_SIZE: usize = 8;

/// Physical capacity allocated on the first write when none is configured.
pub const DEFAULT_INITIAL_SIZE: u64 = 64 * 1024;

/// Wraps a [`ByteStorage`] whose physical length runs ahead of its content.
///
/// The physical file grows geometrically (doubling, at least `initial_size`),
/// while the logical length tracks the highest byte written. The logical
/// length survives reopen through a `<file>.len` sidecar holding it as a
/// big-endian `u64`, written on [`force`](Self::force) and
/// [`close`](Self::close).
pub struct ResizeableMappedFile {
    storage: Box<dyn ByteStorage>,
    len_path: Option<PathBuf>,
    logical_len: Mutex<u64>,
    initial_size: u64,
}

impl ResizeableMappedFile {
    /// Opens the file, restoring the logical length from the sidecar if present.
    pub fn open(storage: Box<dyn ByteStorage>, initial_size: u64) -> Result<Self> {
        let len_path = storage.is_persistent().then(|| len_file_path(storage.path()));
        let logical_len = match &len_path {
            Some(path) if path.exists() => read_len_file(path)?,
            _ => storage.len()?,
        };
        let physical = storage.len()?;
        if logical_len > physical {
            return Err(StorageError::corrupted(format!(
                "logical length {logical_len} exceeds file length {physical} for {}",
                storage.path().display()
            )));
        }
        debug!(path = %storage.path().display(), logical_len, physical, "opened resizeable file");

        Ok(Self {
            storage,
            len_path,
            logical_len: Mutex::new(logical_len),
            initial_size: initial_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn storage(&self) -> &dyn ByteStorage {
        self.storage.as_ref()
    }

    /// Highest byte written plus one.
    pub fn len(&self) -> u64 {
        *self.logical_len.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity of the backing storage.
    pub fn physical_len(&self) -> Result<u64> {
        self.storage.len()
    }

    fn ensure_capacity(&self, end: u64) -> Result<()> {
        let physical = self.storage.len()?;
        if end <= physical {
            return Ok(());
        }
        let mut target = physical.max(self.initial_size);
        while target < end {
            target = target.saturating_mul(2);
        }
        debug!(path = %self.path().display(), from = physical, to = target, "growing file");
        self.storage.set_len(target)
    }

    /// Writes `src` at `offset`, growing the file as needed.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut logical_len = self.logical_len.lock();
        let end = offset + src.len() as u64;
        self.ensure_capacity(end)?;
        self.storage.write(offset, src)?;
        *logical_len = (*logical_len).max(end);
        Ok(())
    }

    /// Appends `src` at the logical end and returns the offset it was written at.
    pub fn append(&self, src: &[u8]) -> Result<u64> {
        let mut logical_len = self.logical_len.lock();
        let offset = *logical_len;
        let end = offset + src.len() as u64;
        self.ensure_capacity(end)?;
        self.storage.write(offset, src)?;
        *logical_len = end;
        Ok(offset)
    }

    /// Reads `dst.len()` bytes at `offset`; bytes past the logical end read as zero.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.storage.read(offset, dst)
    }

    pub fn get_u8(&self, offset: u64) -> Result<u8> {
        self.storage.get_u8(offset)
    }

    pub fn put_u8(&self, offset: u64, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    pub fn get_i32(&self, offset: u64) -> Result<i32> {
        self.storage.get_i32(offset)
    }

    pub fn put_i32(&self, offset: u64, value: i32) -> Result<()> {
        self.write(offset, &self.storage.byte_order().encode_i32(value))
    }

    pub fn get_i64(&self, offset: u64) -> Result<i64> {
        self.storage.get_i64(offset)
    }

    pub fn put_i64(&self, offset: u64, value: i64) -> Result<()> {
        self.write(offset, &self.storage.byte_order().encode_i64(value))
    }

    /// Flushes the storage and records the logical length.
    pub fn force(&self) -> Result<()> {
        let logical_len = *self.logical_len.lock();
        self.storage.force()?;
        match &self.len_path {
            Some(path) if !self.storage.is_read_only() => {
                std::fs::write(path, logical_len.to_be_bytes())?
            }
            _ => {}
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.storage.is_closed() {
            return Ok(());
        }
        let forced = self.force();
        let closed = self.storage.close();
        forced.and(closed)
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }
}

/// Returns `<path>.len`.
pub fn len_file_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".len");
    PathBuf::from(name)
}

fn read_len_file(path: &Path) -> Result<u64> {
    let bytes = std::fs::read(path)?;
    let bytes: [u8; LEN_FILE_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        StorageError::corrupted(format!(
            "length file {} has {} bytes",
            path.display(),
            bytes.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
