//! Byte storage over the shared page pool.

use crate::storage::ByteStorage;
use enumdb_buffer::{PageHandle, PagePool, WeakPageHandle};
use enumdb_common::page::split_offset;
use enumdb_common::{ByteOrder, FileId, PageKey, Result, StorageConfig, StorageError};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Recently used pages remembered per storage. They are not pinned.
const MRU_SLOTS: usize = 3;

/// A file accessed page by page through a [`PagePool`].
///
/// Range requests are split at page boundaries; each piece pins the covering
/// page, copies, and releases it. The logical size grows as soon as a write
/// lands, before any page reaches the disk, and is reconciled with the
/// physical length whenever a read reaches past it.
pub struct PagedFileStorage {
    path: PathBuf,
    pool: Arc<PagePool>,
    file_id: FileId,
    page_size: usize,
    byte_order: ByteOrder,
    read_only: bool,
    sync_on_force: bool,
    /// Logical size in bytes.
    size: AtomicU64,
    /// Most recently used pages, most recent first.
    recent: Mutex<Vec<WeakPageHandle>>,
    closed: AtomicBool,
}

impl PagedFileStorage {
    /// Opens (or, unless read-only, creates) the file and registers it with the pool.
    pub fn open(path: &Path, config: &StorageConfig, pool: Arc<PagePool>) -> Result<Self> {
        config.validate()?;
        let physical = pool
            .channels()
            .execute(path, config.read_only, physical_len)?;
        let file_id = pool.register(path, config.page_size, config.read_only)?;
        debug!(
            path = %path.display(),
            %file_id,
            len = physical,
            page_size = config.page_size,
            "opened paged storage"
        );

        Ok(Self {
            path: path.to_path_buf(),
            pool,
            file_id,
            page_size: config.page_size,
            byte_order: config.byte_order,
            read_only: config.read_only,
            sync_on_force: config.sync_on_force,
            size: AtomicU64::new(physical),
            recent: Mutex::new(Vec::with_capacity(MRU_SLOTS + 1)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
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

    /// Pins the page covering one piece of a request.
    ///
    /// The MRU slots skip the page table when they still point at a resident
    /// page. The handle lives only for the copy, so an idle storage pins
    /// nothing and all of its pages stay evictable.
    fn page(&self, page_index: u32, for_write: bool) -> Result<PageHandle> {
        {
            let mut recent = self.recent.lock();
            if let Some(pos) = recent
                .iter()
                .position(|weak| weak.key().page_index == page_index)
            {
                let weak = recent.remove(pos);
                if let Some(handle) = weak.upgrade() {
                    recent.insert(0, weak);
                    return Ok(handle);
                }
            }
        }

        let key = PageKey::new(self.file_id, page_index);
        let handle = if for_write {
            self.pool.acquire_for_write(key)?
        } else {
            self.pool.acquire(key)?
        };

        let mut recent = self.recent.lock();
        recent.insert(0, handle.downgrade());
        recent.truncate(MRU_SLOTS);
        Ok(handle)
    }

    fn forget_recent(&self) {
        self.recent.lock().clear();
    }

    /// Size covering `end`, refreshed from the file if the cached size is short.
    fn size_for_read(&self, end: u64) -> Result<u64> {
        let size = self.size.load(Ordering::Acquire);
        if end <= size {
            return Ok(size);
        }
        let physical = self
            .pool
            .channels()
            .execute(&self.path, self.read_only, physical_len)?;
        Ok(self.size.fetch_max(physical, Ordering::AcqRel).max(physical))
    }

    /// Calls `f(page_index, offset_in_page, range_in_buffer)` for each page piece.
    fn for_each_piece(
        &self,
        offset: u64,
        len: usize,
        mut f: impl FnMut(u32, usize, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0;
        while done < len {
            let (page_index, in_page) = split_offset(offset + done as u64, self.page_size);
            let n = (self.page_size - in_page).min(len - done);
            f(page_index, in_page, done..done + n)?;
            done += n;
        }
        Ok(())
    }
}

fn physical_len(file: &File) -> std::io::Result<u64> {
    file.metadata().map(|m| m.len())
}

impl ByteStorage for PagedFileStorage {
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
        let end = offset + dst.len() as u64;
        let size = self.size_for_read(end)?;

        let readable = size.saturating_sub(offset).min(dst.len() as u64) as usize;
        dst[readable..].fill(0);
        self.for_each_piece(offset, readable, |page_index, in_page, range| {
            self.page(page_index, false)?.read(in_page, &mut dst[range])
        })
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        self.for_each_piece(offset, src.len(), |page_index, in_page, range| {
            self.page(page_index, true)?.write(in_page, &src[range])
        })?;
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
        let current = self.size.load(Ordering::Acquire);
        if len < current {
            self.forget_recent();
            self.pool.truncate_pages(self.file_id, len)?;
            debug!(path = %self.path.display(), from = current, to = len, "truncated storage");
        }
        self.pool
            .channels()
            .execute(&self.path, false, |f| f.set_len(len))?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.check_open()?;
        self.pool.flush_file(self.file_id)?;
        if self.sync_on_force && !self.read_only {
            self.pool.sync_file(self.file_id)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.forget_recent();
        let synced = if self.sync_on_force && !self.read_only {
            self.pool
                .flush_file(self.file_id)
                .and_then(|_| self.pool.sync_file(self.file_id))
        } else {
            Ok(())
        };
        let unregistered = self.pool.unregister(self.file_id);
        debug!(path = %self.path.display(), "closed paged storage");
        synced.and(unregistered)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for PagedFileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "failed to close paged storage");
        }
    }
}

impl std::fmt::Debug for PagedFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFileStorage")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .field("page_size", &self.page_size)
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}
