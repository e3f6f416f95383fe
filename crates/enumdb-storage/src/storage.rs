//! Byte-addressed storage abstraction and backend selection.

use crate::in_memory::InMemoryStorage;
use crate::paged::PagedFileStorage;
use crate::random_access::RandomAccessStorage;
use enumdb_buffer::PagePool;
use enumdb_common::{ByteOrder, Result, StorageConfig, StorageKind};
use std::path::Path;
use std::sync::Arc;

/// A growable array of bytes backed by a file or memory.
///
/// All operations take `&self`; backends synchronize internally. Multi-byte
/// accessors use the storage's [`ByteOrder`], fixed when it was opened.
pub trait ByteStorage: Send + Sync {
    /// Backing file path (informational for in-memory storages).
    fn path(&self) -> &Path;

    fn byte_order(&self) -> ByteOrder;

    fn is_read_only(&self) -> bool;

    /// Returns false when nothing outlives the process.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Fills `dst` with the bytes at `offset`. Bytes past the end read as zero.
    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()>;

    /// Writes `src` at `offset`, growing the storage if needed.
    fn write(&self, offset: u64, src: &[u8]) -> Result<()>;

    /// Current logical length in bytes.
    fn len(&self) -> Result<u64>;

    /// Grows or shrinks the storage. Shrunk bytes read as zero if regrown.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Makes every completed write durable.
    fn force(&self) -> Result<()>;

    /// Flushes and releases resources. Later calls return `Closed`.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn get_u8(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn put_u8(&self, offset: u64, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    fn get_i32(&self, offset: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(self.byte_order().decode_i32(buf))
    }

    fn put_i32(&self, offset: u64, value: i32) -> Result<()> {
        self.write(offset, &self.byte_order().encode_i32(value))
    }

    fn get_i64(&self, offset: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(self.byte_order().decode_i64(buf))
    }

    fn put_i64(&self, offset: u64, value: i64) -> Result<()> {
        self.write(offset, &self.byte_order().encode_i64(value))
    }
}

/// Opens a storage of the kind selected by `config`.
///
/// File-backed kinds share the pool's open-file cache; only the paged kind
/// caches pages in the pool.
pub fn open_storage(
    path: &Path,
    config: &StorageConfig,
    pool: &Arc<PagePool>,
) -> Result<Box<dyn ByteStorage>> {
    config.validate()?;
    Ok(match config.kind {
        StorageKind::PagedFile => Box::new(PagedFileStorage::open(path, config, Arc::clone(pool))?),
        StorageKind::RandomAccessFile => Box::new(RandomAccessStorage::open(
            path,
            config,
            Arc::clone(pool.channels()),
        )?),
        StorageKind::InMemory => Box::new(InMemoryStorage::new(path, config.byte_order)),
    })
}
