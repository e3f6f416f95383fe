//! Byte storage with direct positional file I/O.

use crate::storage::ByteStorage;
use enumdb_buffer::{read_at, write_all_at, ChannelCache};
use enumdb_common::{ByteOrder, Result, StorageConfig, StorageError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A file read and written in place, without page caching.
///
/// Suited to small or write-once files where the page pool only adds copies.
pub struct RandomAccessStorage {
    path: PathBuf,
    channels: Arc<ChannelCache>,
    byte_order: ByteOrder,
    read_only: bool,
    sync_on_force: bool,
    size: AtomicU64,
    closed: AtomicBool,
}

impl RandomAccessStorage {
    pub fn open(path: &Path, config: &StorageConfig, channels: Arc<ChannelCache>) -> Result<Self> {
        let size = channels.execute(path, config.read_only, |f| f.metadata().map(|m| m.len()))?;
        debug!(path = %path.display(), len = size, "opened random access storage");
        Ok(Self {
            path: path.to_path_buf(),
            channels,
            byte_order: config.byte_order,
            read_only: config.read_only,
            sync_on_force: config.sync_on_force,
            size: AtomicU64::new(size),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed(&self.path));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

impl ByteStorage for RandomAccessStorage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_open()?;
        dst.fill(0);
        let size = self.size.load(Ordering::Acquire);
        let readable = size.saturating_sub(offset).min(dst.len() as u64) as usize;
        if readable > 0 {
            self.channels.execute(&self.path, self.read_only, |f| {
                read_at(f, &mut dst[..readable], offset)
            })?;
        }
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        self.channels
            .execute(&self.path, false, |f| write_all_at(f, src, offset))?;
        self.size
            .fetch_max(offset + src.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.size.load(Ordering::Acquire))
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        self.channels
            .execute(&self.path, false, |f| f.set_len(len))?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.check_open()?;
        if self.sync_on_force && !self.read_only {
            self.channels
                .execute(&self.path, false, |f| f.sync_data())?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let synced = if self.sync_on_force && !self.read_only {
            self.channels
                .execute(&self.path, false, |f| f.sync_data())
                .map_err(StorageError::from)
        } else {
            Ok(())
        };
        self.channels.close_all_for(&self.path);
        debug!(path = %self.path.display(), "closed random access storage");
        synced
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
