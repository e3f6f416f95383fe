//! Heap-backed byte storage.

use crate::storage::ByteStorage;
use enumdb_common::{ByteOrder, Result, StorageError};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Byte storage that lives in a `Vec<u8>`. Nothing is persisted.
#[derive(Debug)]
pub struct InMemoryStorage {
    path: PathBuf,
    byte_order: ByteOrder,
    bytes: RwLock<Vec<u8>>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    /// Creates an empty storage. `path` only names it in errors.
    pub fn new(path: &Path, byte_order: ByteOrder) -> Self {
        Self {
            path: path.to_path_buf(),
            byte_order,
            bytes: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed(&self.path));
        }
        Ok(())
    }
}

impl ByteStorage for InMemoryStorage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_open()?;
        let bytes = self.bytes.read();
        dst.fill(0);
        let start = (offset as usize).min(bytes.len());
        let end = (start + dst.len()).min(bytes.len());
        dst[..end - start].copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + src.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.bytes.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.check_open()?;
        self.bytes.write().resize(len as usize, 0);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut bytes = self.bytes.write();
            bytes.clear();
            bytes.shrink_to_fit();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
