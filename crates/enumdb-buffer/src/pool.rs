//! Page pool manager.

use crate::channel::{read_at, write_all_at, ChannelCache};
use crate::frame::{FrameId, FrameState, PageFrame, WriteBitmap};
use crate::page_table::PageTable;
use crate::recycler::BufferRecycler;
use crate::replacer::{LruReplacer, Replacer};
use enumdb_common::page::{validate_page_size, FileId, PageKey, MIN_PAGE_SIZE};
use enumdb_common::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, error, warn};

/// Smallest pool produced by [`PagePool::auto_sized`] (16 MB).
const MIN_AUTO_CAPACITY: usize = 16 * 1024 * 1024;

/// Configuration for the page pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagePoolConfig {
    /// Byte budget for resident pages. Exceeded only when every page is pinned.
    pub capacity_bytes: usize,
    /// Upper bound on simultaneously open file handles.
    pub max_open_files: usize,
    /// Bytes of released page buffers kept for reuse.
    pub recycled_buffer_bytes: usize,
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            max_open_files: 64,
            recycled_buffer_bytes: 8 * 1024 * 1024,
        }
    }
}

impl PagePoolConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidParameter {
                name: "capacity_bytes".to_string(),
                value: self.capacity_bytes.to_string(),
            });
        }
        if self.max_open_files == 0 {
            return Err(StorageError::InvalidParameter {
                name: "max_open_files".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// A file registered with the pool.
#[derive(Debug)]
pub struct FileEntry {
    pub file_id: FileId,
    pub path: PathBuf,
    pub page_size: usize,
    pub read_only: bool,
}

/// Dirty victim chosen under the pool lock and written after it is released.
struct WriteBack {
    file: Arc<FileEntry>,
    key: PageKey,
    frame: Arc<PageFrame>,
}

/// State guarded by the pool lock.
struct PoolInner {
    /// Arena of frames; slots are reused through `free_slots`.
    frames: Vec<Arc<PageFrame>>,
    /// File of the page installed in each frame, by frame id.
    owners: Vec<Option<Arc<FileEntry>>>,
    free_slots: Vec<FrameId>,
    table: PageTable,
    resident_bytes: usize,
}

/// Page pool manager.
///
/// Caches fixed-size pages of registered files under a global byte budget:
/// - Page table plus frame arena behind a single pool lock
/// - LRU replacement among unpinned pages
/// - Per-page RwLock for content, pin counts for residency
/// - Dirty range tracking and write-back on eviction, flush and invalidation
///
/// Pages are pinned by [`PageHandle`]s. A pinned page is never evicted; if
/// every resident page is pinned the pool overcommits instead of failing.
pub struct PagePool {
    config: PagePoolConfig,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    files: RwLock<HashMap<FileId, Arc<FileEntry>>>,
    next_file_id: AtomicU32,
    channels: Arc<ChannelCache>,
    recycler: BufferRecycler,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

impl PagePool {
    /// Creates a pool with its own file handle cache.
    pub fn new(config: PagePoolConfig) -> Self {
        let channels = Arc::new(ChannelCache::new(config.max_open_files));
        Self::with_channels(config, channels)
    }

    /// Creates a pool sharing an existing file handle cache.
    pub fn with_channels(config: PagePoolConfig, channels: Arc<ChannelCache>) -> Self {
        let recycler = BufferRecycler::new(config.recycled_buffer_bytes);
        Self {
            config,
            inner: Mutex::new(PoolInner {
                frames: Vec::new(),
                owners: Vec::new(),
                free_slots: Vec::new(),
                table: PageTable::new(),
                resident_bytes: 0,
            }),
            replacer: LruReplacer::new(),
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
            channels,
            recycler,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Creates a page pool sized to 25% of available system RAM.
    ///
    /// Never smaller than 16 MB so low-memory systems still cache usefully.
    pub fn auto_sized() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let capacity_bytes = (available_bytes / 4).max(MIN_AUTO_CAPACITY);
        debug!(capacity_bytes, "sizing page pool from available memory");

        Self::new(PagePoolConfig {
            capacity_bytes,
            ..PagePoolConfig::default()
        })
    }

    pub fn config(&self) -> &PagePoolConfig {
        &self.config
    }

    /// Returns the file handle cache used for all page I/O.
    pub fn channels(&self) -> &Arc<ChannelCache> {
        &self.channels
    }

    /// Registers a file and assigns it a [`FileId`].
    ///
    /// A path can be registered once at a time, so every page of a file has a
    /// single cached copy.
    pub fn register(&self, path: &Path, page_size: usize, read_only: bool) -> Result<FileId> {
        validate_page_size(page_size)?;
        let mut files = self.files.write();
        if files.values().any(|entry| entry.path == path) {
            return Err(StorageError::AlreadyInUse {
                path: path.to_path_buf(),
            });
        }
        let file_id = FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed));
        files.insert(
            file_id,
            Arc::new(FileEntry {
                file_id,
                path: path.to_path_buf(),
                page_size,
                read_only,
            }),
        );
        debug!(%file_id, path = %path.display(), page_size, read_only, "registered file");
        Ok(file_id)
    }

    /// Flushes and drops every page of a file, then forgets the file.
    pub fn unregister(&self, file_id: FileId) -> Result<()> {
        self.invalidate(file_id)?;
        let removed = self.files.write().remove(&file_id);
        if let Some(entry) = removed {
            self.channels.close_all_for(&entry.path);
            debug!(%file_id, path = %entry.path.display(), "unregistered file");
        }
        Ok(())
    }

    /// Looks up a registered file.
    pub fn file(&self, file_id: FileId) -> Result<Arc<FileEntry>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| StorageError::InvalidParameter {
                name: "file_id".to_string(),
                value: file_id.to_string(),
            })
    }

    /// Pins a page with read intent. Disk content is loaded before returning.
    pub fn acquire(self: &Arc<Self>, key: PageKey) -> Result<PageHandle> {
        self.pin_page(key, false)
    }

    /// Pins a page with write intent.
    ///
    /// The disk read is deferred until the page is first read, so a page that
    /// is only written never touches the disk before its flush.
    pub fn acquire_for_write(self: &Arc<Self>, key: PageKey) -> Result<PageHandle> {
        self.pin_page(key, true)
    }

    fn pin_page(self: &Arc<Self>, key: PageKey, for_write: bool) -> Result<PageHandle> {
        let file = self.file(key.file_id)?;
        if for_write && file.read_only {
            return Err(StorageError::ReadOnly {
                path: file.path.clone(),
            });
        }

        let (frame, created, write_backs) = {
            let mut inner = self.inner.lock();
            if let Some(frame_id) = inner.table.get(key) {
                let frame = Arc::clone(&inner.frames[frame_id.0 as usize]);
                frame.pin();
                self.replacer.record_access(frame_id);
                self.hits.fetch_add(1, Ordering::Relaxed);
                (frame, false, Vec::new())
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let write_backs = self.reclaim(&mut inner, file.page_size);

                let frame_id = match inner.free_slots.pop() {
                    Some(frame_id) => frame_id,
                    None => {
                        let frame_id = FrameId(inner.frames.len() as u32);
                        inner.frames.push(Arc::new(PageFrame::new(frame_id)));
                        inner.owners.push(None);
                        frame_id
                    }
                };
                let frame = Arc::clone(&inner.frames[frame_id.0 as usize]);
                frame.install(key, self.recycler.allocate(file.page_size));
                inner.owners[frame_id.0 as usize] = Some(Arc::clone(&file));
                frame.pin();
                inner.table.insert(key, frame_id);
                inner.resident_bytes += file.page_size;
                self.replacer.record_access(frame_id);
                (frame, true, write_backs)
            }
        };
        for write_back in write_backs {
            self.finish_write_back(write_back);
        }

        let handle = PageHandle {
            pool: Arc::clone(self),
            file,
            frame,
            key,
        };
        if !for_write {
            if let Err(e) = handle.ensure_loaded() {
                let frame_id = handle.frame.frame_id();
                drop(handle);
                if created {
                    self.discard_unpopulated(key, frame_id);
                }
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Evicts unpinned pages until `incoming` more bytes fit the budget.
    ///
    /// Clean victims are freed on the spot. Dirty victims stay mapped in
    /// `PreTombstone` and are returned for write-back once the pool lock is
    /// released; their bytes count as leaving.
    fn reclaim(&self, inner: &mut PoolInner, incoming: usize) -> Vec<WriteBack> {
        let mut write_backs = Vec::new();
        let mut leaving = 0;
        while inner.resident_bytes - leaving + incoming > self.config.capacity_bytes {
            let victim = {
                let frames = &inner.frames;
                self.replacer.evict(&|frame_id| {
                    let frame = &frames[frame_id.0 as usize];
                    frame.pin_count() == 0 && frame.state() == FrameState::Usable
                })
            };
            let Some(frame_id) = victim else {
                if write_backs.is_empty() {
                    warn!(
                        resident_bytes = inner.resident_bytes,
                        capacity_bytes = self.config.capacity_bytes,
                        "all resident pages are pinned, page pool overcommitted"
                    );
                }
                break;
            };

            let frame = Arc::clone(&inner.frames[frame_id.0 as usize]);
            if !frame.try_transition(FrameState::Usable, FrameState::PreTombstone) {
                continue;
            }
            // A weak handle may have pinned it after the victim was chosen
            if frame.is_pinned() {
                frame.set_state(FrameState::Usable);
                self.replacer.record_access(frame_id);
                continue;
            }
            let Some(key) = frame.key() else {
                continue;
            };

            if frame.is_dirty() {
                match self.files.read().get(&key.file_id).cloned() {
                    Some(file) => {
                        leaving += file.page_size;
                        write_backs.push(WriteBack { file, key, frame });
                        continue;
                    }
                    None => warn!(page = %key, "dropping dirty page of unregistered file"),
                }
            }
            self.free_frame(inner, key, &frame);
        }
        write_backs
    }

    /// Writes an evicted dirty page and frees its frame.
    ///
    /// The page stays resident if the write fails or if it was pinned or
    /// modified again meanwhile. A page invalidated during the write is
    /// handed to the sweep.
    fn finish_write_back(&self, write_back: WriteBack) {
        let WriteBack { file, key, frame } = write_back;
        let frame_id = frame.frame_id();
        let flushed = self.flush_frame(&file, key, &frame);
        if let Err(e) = &flushed {
            error!(page = %key, error = %e, "failed to write back evicted page");
        }

        let mut inner = self.inner.lock();
        if inner.table.get(key) != Some(frame_id) {
            frame.set_state(FrameState::AboutToUnmap);
            let unpinned = frame.pin_count() == 0;
            drop(inner);
            if unpinned {
                if let Err(e) = self.sweep(&file, key, &frame) {
                    error!(page = %key, error = %e, "failed to write back released page");
                }
            }
            return;
        }

        if flushed.is_ok() && frame.pin_count() == 0 && !frame.is_dirty() {
            self.free_frame(&mut inner, key, &frame);
        } else {
            frame.set_state(FrameState::Usable);
            self.replacer.record_access(frame_id);
        }
    }

    /// Unmaps a torn-down frame and returns its buffer to the recycler.
    fn free_frame(&self, inner: &mut PoolInner, key: PageKey, frame: &PageFrame) {
        let frame_id = frame.frame_id();
        inner.table.remove_if(key, frame_id);
        self.replacer.remove(frame_id);
        let buffer = frame.reset();
        inner.resident_bytes -= buffer.len();
        inner.free_slots.push(frame_id);
        self.recycler.release(buffer);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops a frame whose initial load failed, unless someone else uses it.
    fn discard_unpopulated(&self, key: PageKey, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let frame = Arc::clone(&inner.frames[frame_id.0 as usize]);
        if !frame.try_transition(FrameState::Usable, FrameState::PreTombstone) {
            return;
        }
        if frame.key() != Some(key)
            || frame.is_pinned()
            || frame.is_loaded()
            || frame.is_dirty()
            || !inner.table.remove_if(key, frame_id)
        {
            frame.set_state(FrameState::Usable);
            return;
        }
        self.replacer.remove(frame_id);
        let buffer = frame.reset();
        inner.resident_bytes -= buffer.len();
        inner.free_slots.push(frame_id);
        self.recycler.release(buffer);
    }

    /// Merges disk content into a page that has not been loaded yet.
    ///
    /// Bytes written before the load keep their new values.
    fn load_frame(&self, file: &FileEntry, key: PageKey, frame: &PageFrame) -> Result<()> {
        if frame.is_loaded() {
            return Ok(());
        }
        let mut data = frame.write_data();
        if frame.is_loaded() || frame.key() != Some(key) {
            return Ok(());
        }

        let mut disk = self.recycler.allocate(file.page_size);
        let offset = key.offset(file.page_size);
        if let Err(e) = self
            .channels
            .execute(&file.path, file.read_only, |f| read_at(f, &mut disk, offset))
        {
            self.recycler.release(disk);
            return Err(e.into());
        }

        match data.written.take() {
            Some(written) => {
                for (start, end) in written.runs(false) {
                    data.bytes[start..end].copy_from_slice(&disk[start..end]);
                }
            }
            None => data.bytes.copy_from_slice(&disk),
        }
        self.recycler.release(disk);
        frame.set_loaded(true);
        Ok(())
    }

    /// Writes the modified region of one page to its file.
    ///
    /// A page that was never loaded only writes the bytes actually written, so
    /// untouched parts of the page keep their disk content.
    fn flush_frame(&self, file: &FileEntry, key: PageKey, frame: &PageFrame) -> Result<bool> {
        let _flush = frame.flush_lock();
        let data = frame.read_data();
        if frame.key() != Some(key) {
            return Ok(false);
        }
        let Some((min, max)) = frame.modified_region() else {
            return Ok(false);
        };

        let runs: Vec<(usize, usize)> = match (&data.written, frame.is_loaded()) {
            (Some(written), false) => written
                .runs(true)
                .into_iter()
                .filter_map(|(start, end)| {
                    let (start, end) = (start.max(min), end.min(max));
                    (start < end).then_some((start, end))
                })
                .collect(),
            _ => vec![(min, max)],
        };

        let base = key.offset(file.page_size);
        self.channels.execute(&file.path, file.read_only, |f| {
            for &(start, end) in &runs {
                write_all_at(f, &data.bytes[start..end], base + start as u64)?;
            }
            Ok(())
        })?;
        frame.clear_modified();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Tears down a page that left the page table while pinned.
    ///
    /// Whoever wins the transition out of `AboutToUnmap` flushes remaining
    /// changes and returns the frame to the free list.
    fn sweep(&self, file: &FileEntry, key: PageKey, frame: &PageFrame) -> Result<()> {
        if !frame.try_transition(FrameState::AboutToUnmap, FrameState::PreTombstone) {
            return Ok(());
        }
        let flushed = self.flush_frame(file, key, frame);
        let buffer = frame.reset();
        {
            let mut inner = self.inner.lock();
            inner.resident_bytes -= buffer.len();
            inner.free_slots.push(frame.frame_id());
        }
        self.recycler.release(buffer);
        // A sweep after unregister must not leave the reopened channel cached
        let registered = self.files.read().values().any(|entry| entry.path == file.path);
        if !registered {
            self.channels.close_all_for(&file.path);
        }
        flushed.map(|_| ())
    }

    /// Sweeps a frame whose last pin came from a failed weak upgrade.
    fn sweep_released(&self, frame: &PageFrame) {
        let (file, key) = {
            let inner = self.inner.lock();
            (inner.owners[frame.frame_id().0 as usize].clone(), frame.key())
        };
        if let (Some(file), Some(key)) = (file, key) {
            if file.file_id == key.file_id {
                if let Err(e) = self.sweep(&file, key, frame) {
                    error!(page = %key, error = %e, "failed to write back released page");
                }
            }
        }
    }

    fn resident_pages(&self, file_id: FileId) -> Vec<(PageKey, Arc<PageFrame>)> {
        let inner = self.inner.lock();
        inner
            .table
            .pages_of(file_id)
            .into_iter()
            .map(|(key, frame_id)| (key, Arc::clone(&inner.frames[frame_id.0 as usize])))
            .collect()
    }

    /// Writes every dirty page of a file. Returns the number of pages written.
    pub fn flush_file(&self, file_id: FileId) -> Result<usize> {
        let file = self.file(file_id)?;
        let mut flushed = 0;
        for (key, frame) in self.resident_pages(file_id) {
            if frame.is_dirty() && self.flush_frame(&file, key, &frame)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Writes every dirty page of every registered file.
    pub fn flush_all(&self) -> Result<usize> {
        let file_ids: Vec<FileId> = self.files.read().keys().copied().collect();
        let mut flushed = 0;
        for file_id in file_ids {
            flushed += self.flush_file(file_id)?;
        }
        Ok(flushed)
    }

    /// Forces written data of a file to stable storage.
    pub fn sync_file(&self, file_id: FileId) -> Result<()> {
        let file = self.file(file_id)?;
        if file.read_only {
            return Ok(());
        }
        self.channels
            .execute(&file.path, false, |f| f.sync_data())?;
        Ok(())
    }

    /// Flushes a file and removes all of its pages from the pool.
    ///
    /// Pages still pinned are marked for unmapping; the last handle released
    /// writes their final changes and frees them.
    pub fn invalidate(&self, file_id: FileId) -> Result<()> {
        self.flush_file(file_id)?;
        let file = self.file(file_id)?;

        let mut unpinned = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (key, frame_id) in inner.table.pages_of(file_id) {
                inner.table.remove(key);
                self.replacer.remove(frame_id);
                let frame = Arc::clone(&inner.frames[frame_id.0 as usize]);
                if frame.try_transition(FrameState::Usable, FrameState::AboutToUnmap)
                    && frame.pin_count() == 0
                {
                    unpinned.push((key, frame));
                }
            }
        }

        let mut result = Ok(());
        for (key, frame) in unpinned {
            if let Err(e) = self.sweep(&file, key, &frame) {
                result = Err(e);
            }
        }
        result
    }

    /// Zeroes resident bytes of a file at or beyond `new_len`.
    ///
    /// Called before the file itself is shortened, so a later growth never
    /// exposes stale cached bytes.
    pub fn truncate_pages(&self, file_id: FileId, new_len: u64) -> Result<()> {
        let file = self.file(file_id)?;
        let page_size = file.page_size as u64;
        for (key, frame) in self.resident_pages(file_id) {
            let start = key.offset(file.page_size);
            if start + page_size <= new_len {
                continue;
            }
            let keep = new_len.saturating_sub(start) as usize;
            if keep > 0 {
                self.load_frame(&file, key, &frame)?;
            }

            let mut data = frame.write_data();
            if frame.key() != Some(key) {
                continue;
            }
            data.bytes[keep..].fill(0);
            if keep == 0 {
                data.written = None;
                frame.set_loaded(true);
            }
            frame.clamp_modified(keep);
        }
        Ok(())
    }

    /// Checks if a page is resident.
    pub fn contains(&self, key: PageKey) -> bool {
        self.inner.lock().table.get(key).is_some()
    }

    /// Returns statistics about the page pool.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut pinned_pages = 0;
        let mut dirty_pages = 0;
        for (_, frame_id) in inner.table.entries() {
            let frame = &inner.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_pages += 1;
            }
            if frame.is_dirty() {
                dirty_pages += 1;
            }
        }

        PoolStats {
            capacity_bytes: self.config.capacity_bytes,
            resident_bytes: inner.resident_bytes,
            resident_pages: inner.table.len(),
            pinned_pages,
            dirty_pages,
            free_frames: inner.free_slots.len(),
            registered_files: self.files.read().len(),
            open_files: self.channels.open_count(),
            recycled_bytes: self.recycler.cached_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about the page pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured byte budget.
    pub capacity_bytes: usize,
    /// Bytes held by resident pages, including swept-but-pinned ones.
    pub resident_bytes: usize,
    /// Pages in the page table.
    pub resident_pages: usize,
    /// Resident pages with live handles.
    pub pinned_pages: usize,
    /// Resident pages with unflushed changes.
    pub dirty_pages: usize,
    /// Frame slots ready for reuse.
    pub free_frames: usize,
    pub registered_files: usize,
    pub open_files: usize,
    pub recycled_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

/// Pinned reference to a resident page.
///
/// The page cannot be evicted while a handle exists. Dropping the last handle
/// of a page removed by [`PagePool::invalidate`] writes and frees it.
pub struct PageHandle {
    pool: Arc<PagePool>,
    file: Arc<FileEntry>,
    frame: Arc<PageFrame>,
    key: PageKey,
}

impl PageHandle {
    /// Returns the page key.
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size
    }

    /// File offset of the first byte of the page.
    pub fn file_offset(&self) -> u64 {
        self.key.offset(self.file.page_size)
    }

    /// Returns true if disk content has been merged into the page.
    pub fn is_loaded(&self) -> bool {
        self.frame.is_loaded()
    }

    /// Returns true if the page has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Returns a reference to this page that does not keep it resident.
    pub fn downgrade(&self) -> WeakPageHandle {
        WeakPageHandle {
            pool: Arc::clone(&self.pool),
            file: Arc::clone(&self.file),
            frame: Arc::clone(&self.frame),
            key: self.key,
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        self.pool.load_frame(&self.file, self.key, &self.frame)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.file.page_size {
            return Err(StorageError::OutOfBounds {
                offset: self.file_offset() + offset as u64,
                len: len as u64,
            });
        }
        Ok(())
    }

    /// Copies bytes starting at `offset` within the page into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        self.ensure_loaded()?;
        let data = self.frame.read_data();
        dst.copy_from_slice(&data.bytes[offset..offset + dst.len()]);
        Ok(())
    }

    /// Runs `f` over the loaded page content under the page read lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.ensure_loaded()?;
        let data = self.frame.read_data();
        Ok(f(&data.bytes))
    }

    /// Copies `src` into the page at `offset` and widens the dirty region.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        if self.file.read_only {
            return Err(StorageError::ReadOnly {
                path: self.file.path.clone(),
            });
        }
        self.check_range(offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        let mut data = self.frame.write_data();
        data.bytes[offset..offset + src.len()].copy_from_slice(src);
        if !self.frame.is_loaded() {
            let page_size = self.file.page_size;
            let written = data
                .written
                .get_or_insert_with(|| WriteBitmap::new(page_size));
            written.mark(offset, offset + src.len());
            if written.is_full() {
                // Every byte is fresh, disk content is no longer needed
                data.written = None;
                self.frame.set_loaded(true);
            }
        }
        self.frame.mark_modified(offset, src.len());
        Ok(())
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        self.frame.pin();
        Self {
            pool: Arc::clone(&self.pool),
            file: Arc::clone(&self.file),
            frame: Arc::clone(&self.frame),
            key: self.key,
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.frame.unpin() == 0 && self.frame.state() == FrameState::AboutToUnmap {
            if let Err(e) = self.pool.sweep(&self.file, self.key, &self.frame) {
                error!(page = %self.key, error = %e, "failed to write back released page");
            }
        }
    }
}

/// Unpinned reference to a page that may have been evicted since.
///
/// Upgrading pins the frame first and then checks that it still holds the
/// same page. Eviction and invalidation change the frame state first and then
/// check the pin count, so one side always sees the other.
pub struct WeakPageHandle {
    pool: Arc<PagePool>,
    file: Arc<FileEntry>,
    frame: Arc<PageFrame>,
    key: PageKey,
}

impl WeakPageHandle {
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Pins the page again if it is still resident, without the pool lock.
    pub fn upgrade(&self) -> Option<PageHandle> {
        self.frame.pin();
        if self.frame.state() != FrameState::Usable || self.frame.key() != Some(self.key) {
            // The frame may hold another page by now, so sweep by its current owner
            if self.frame.unpin() == 0 && self.frame.state() == FrameState::AboutToUnmap {
                self.pool.sweep_released(&self.frame);
            }
            return None;
        }
        self.pool.replacer.record_access(self.frame.frame_id());
        self.pool.hits.fetch_add(1, Ordering::Relaxed);
        Some(PageHandle {
            pool: Arc::clone(&self.pool),
            file: Arc::clone(&self.file),
            frame: Arc::clone(&self.frame),
            key: self.key,
        })
    }
}

impl std::fmt::Debug for WeakPageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakPageHandle")
            .field("key", &self.key)
            .field("path", &self.file.path)
            .finish()
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("key", &self.key)
            .field("path", &self.file.path)
            .field("frame", &self.frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const PAGE: usize = 4096;

    fn create_test_pool(pages: usize) -> Arc<PagePool> {
        Arc::new(PagePool::new(PagePoolConfig {
            capacity_bytes: pages * PAGE,
            max_open_files: 8,
            recycled_buffer_bytes: 4 * PAGE,
        }))
    }

    fn file_with(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_page_pool_config_default() {
        let config = PagePoolConfig::default();
        assert!(config.validate().is_ok());
        assert!(PagePoolConfig {
            capacity_bytes: 0,
            ..config.clone()
        }
        .validate()
        .is_err());
        assert!(PagePoolConfig {
            max_open_files: 0,
            ..config
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_page_pool_config_serde_roundtrip() {
        let original = PagePoolConfig {
            capacity_bytes: 1 << 20,
            max_open_files: 3,
            recycled_buffer_bytes: 0,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PagePoolConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.capacity_bytes, original.capacity_bytes);
        assert_eq!(deserialized.max_open_files, original.max_open_files);
        assert_eq!(deserialized.recycled_buffer_bytes, 0);
    }

    #[test]
    fn test_register_rejects_duplicate_path() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        let path = dir.path().join("a.dat");

        let first = pool.register(&path, PAGE, false).unwrap();
        let err = pool.register(&path, PAGE, false).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyInUse { .. }));

        pool.unregister(first).unwrap();
        assert!(pool.register(&path, PAGE, false).is_ok());
    }

    #[test]
    fn test_register_rejects_bad_page_size() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        assert!(pool.register(&dir.path().join("a"), 1000, false).is_err());
    }

    #[test]
    fn test_acquire_reads_disk() {
        let dir = tempdir().unwrap();
        let mut contents = vec![0u8; 2 * PAGE];
        contents[PAGE + 5] = 0x42;
        let path = file_with(&dir, "data", &contents);
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, true).unwrap();

        let handle = pool.acquire(PageKey::new(file, 1)).unwrap();
        assert!(handle.is_loaded());
        let mut buf = [0u8; 1];
        handle.read(5, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);

        // Past end of file reads as zeros
        let beyond = pool.acquire(PageKey::new(file, 9)).unwrap();
        assert!(beyond.with_data(|d| d.iter().all(|&b| b == 0)).unwrap());
    }

    #[test]
    fn test_write_and_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire(PageKey::new(file, 0)).unwrap();
        handle.write(10, b"hello").unwrap();
        assert!(handle.is_dirty());
        assert_eq!(pool.stats().dirty_pages, 1);

        assert_eq!(pool.flush_file(file).unwrap(), 1);
        assert!(!handle.is_dirty());
        assert_eq!(pool.flush_file(file).unwrap(), 0);

        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 15);
        assert_eq!(&on_disk[10..15], b"hello");
    }

    #[test]
    fn test_write_intent_preserves_untouched_disk_bytes() {
        let dir = tempdir().unwrap();
        let path = file_with(&dir, "data", &vec![0xAAu8; PAGE]);
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        assert!(!handle.is_loaded());
        handle.write(100, &[1u8; 10]).unwrap();
        handle.write(2000, &[2u8; 4]).unwrap();
        pool.flush_file(file).unwrap();
        assert!(!handle.is_loaded());

        let on_disk = fs::read(&path).unwrap();
        assert!(on_disk[..100].iter().all(|&b| b == 0xAA));
        assert!(on_disk[100..110].iter().all(|&b| b == 1));
        assert!(on_disk[110..2000].iter().all(|&b| b == 0xAA));
        assert!(on_disk[2000..2004].iter().all(|&b| b == 2));
        assert!(on_disk[2004..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_load_merges_unwritten_ranges() {
        let dir = tempdir().unwrap();
        let path = file_with(&dir, "data", &vec![0xAAu8; PAGE]);
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(8, &[7u8; 8]).unwrap();

        let mut buf = [0u8; 24];
        handle.read(0, &mut buf).unwrap();
        assert!(handle.is_loaded());
        assert_eq!(&buf[..8], &[0xAA; 8]);
        assert_eq!(&buf[8..16], &[7; 8]);
        assert_eq!(&buf[16..], &[0xAA; 8]);
    }

    #[test]
    fn test_full_page_write_skips_load() {
        let dir = tempdir().unwrap();
        let path = file_with(&dir, "data", &vec![0xAAu8; PAGE]);
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(0, &vec![3u8; PAGE / 2]).unwrap();
        assert!(!handle.is_loaded());
        handle.write(PAGE / 2, &vec![4u8; PAGE / 2]).unwrap();
        assert!(handle.is_loaded());
    }

    #[test]
    fn test_out_of_bounds_access() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        let file = pool.register(&dir.path().join("d"), PAGE, false).unwrap();
        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();

        let err = handle.write(PAGE - 2, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, StorageError::OutOfBounds { .. }));
        let mut buf = [0u8; 8];
        assert!(handle.read(PAGE - 4, &mut buf).is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = file_with(&dir, "data", &[0u8; 16]);
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, true).unwrap();

        let err = pool.acquire_for_write(PageKey::new(file, 0)).unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly { .. }));

        let handle = pool.acquire(PageKey::new(file, 0)).unwrap();
        assert!(matches!(
            handle.write(0, &[1]),
            Err(StorageError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_eviction_respects_budget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(2);
        let file = pool.register(&path, PAGE, false).unwrap();

        for i in 0..3 {
            let handle = pool.acquire_for_write(PageKey::new(file, i)).unwrap();
            handle.write(0, &[i as u8 + 1]).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.resident_pages, 2);
        assert_eq!(stats.resident_bytes, 2 * PAGE);
        assert_eq!(stats.evictions, 1);
        assert!(!pool.contains(PageKey::new(file, 0)));

        // The dirty victim was written back before its frame was reused
        let on_disk = fs::read(&path).unwrap();
        assert_eq!(on_disk[0], 1);

        let handle = pool.acquire(PageKey::new(file, 0)).unwrap();
        let mut buf = [0u8; 1];
        handle.read(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_eviction_order_is_lru() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(2);
        let file = pool.register(&dir.path().join("data"), PAGE, false).unwrap();

        drop(pool.acquire_for_write(PageKey::new(file, 0)).unwrap());
        drop(pool.acquire_for_write(PageKey::new(file, 1)).unwrap());
        // Page 0 becomes the most recent
        drop(pool.acquire_for_write(PageKey::new(file, 0)).unwrap());
        drop(pool.acquire_for_write(PageKey::new(file, 2)).unwrap());

        assert!(pool.contains(PageKey::new(file, 0)));
        assert!(!pool.contains(PageKey::new(file, 1)));
        assert!(pool.contains(PageKey::new(file, 2)));
    }

    #[test]
    fn test_pinned_pages_overcommit() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(2);
        let file = pool.register(&dir.path().join("data"), PAGE, false).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|i| pool.acquire_for_write(PageKey::new(file, i)).unwrap())
            .collect();
        let stats = pool.stats();
        assert_eq!(stats.resident_pages, 3);
        assert_eq!(stats.pinned_pages, 3);
        assert_eq!(stats.evictions, 0);
        drop(handles);

        // Once unpinned, the next miss brings the pool back under budget
        drop(pool.acquire_for_write(PageKey::new(file, 3)).unwrap());
        assert_eq!(pool.stats().resident_pages, 2);
    }

    #[test]
    fn test_cloned_handle_keeps_pin() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(1);
        let file = pool.register(&dir.path().join("data"), PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        let clone = handle.clone();
        drop(handle);
        assert_eq!(pool.stats().pinned_pages, 1);

        drop(pool.acquire_for_write(PageKey::new(file, 1)).unwrap());
        assert!(pool.contains(PageKey::new(file, 0)));
        drop(clone);
        assert_eq!(pool.stats().pinned_pages, 0);
    }

    #[test]
    fn test_failed_load_leaves_no_frame() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        let file = pool
            .register(&dir.path().join("missing"), PAGE, true)
            .unwrap();

        let err = pool.acquire(PageKey::new(file, 0)).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!pool.contains(PageKey::new(file, 0)));
        assert_eq!(pool.stats().resident_bytes, 0);
    }

    #[test]
    fn test_invalidate_unpinned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(0, b"abc").unwrap();
        drop(handle);

        pool.invalidate(file).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.resident_pages, 0);
        assert_eq!(stats.resident_bytes, 0);
        assert_eq!(&fs::read(&path).unwrap()[..3], b"abc");
    }

    #[test]
    fn test_invalidate_pinned_sweeps_on_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();
        let key = PageKey::new(file, 0);

        let handle = pool.acquire_for_write(key).unwrap();
        pool.invalidate(file).unwrap();
        assert!(!pool.contains(key));
        assert_eq!(pool.stats().resident_bytes, PAGE);

        // Still usable until released; the release writes it out
        handle.write(0, b"late").unwrap();
        drop(handle);
        assert_eq!(pool.stats().resident_bytes, 0);
        assert_eq!(&fs::read(&path).unwrap()[..4], b"late");

        let fresh = pool.acquire(key).unwrap();
        let mut buf = [0u8; 4];
        fresh.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"late");
    }

    #[test]
    fn test_truncate_pages_zeroes_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let first = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        first.write(0, &vec![9u8; PAGE]).unwrap();
        let second = pool.acquire_for_write(PageKey::new(file, 1)).unwrap();
        second.write(0, &[9u8; 16]).unwrap();

        pool.truncate_pages(file, 100).unwrap();

        let mut buf = vec![0u8; PAGE];
        first.read(0, &mut buf).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 9));
        assert!(buf[100..].iter().all(|&b| b == 0));
        second.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert!(!second.is_dirty());

        pool.flush_file(file).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_stats_hits_and_misses() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        let file = pool.register(&dir.path().join("data"), PAGE, false).unwrap();

        drop(pool.acquire_for_write(PageKey::new(file, 0)).unwrap());
        drop(pool.acquire_for_write(PageKey::new(file, 0)).unwrap());
        drop(pool.acquire_for_write(PageKey::new(file, 1)).unwrap());

        let stats = pool.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.registered_files, 1);
        assert_eq!(stats.capacity_bytes, 4 * PAGE);
    }

    #[test]
    fn test_unregister_closes_channels() {
        let dir = tempdir().unwrap();
        let pool = create_test_pool(4);
        let file = pool.register(&dir.path().join("data"), PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(0, &[1]).unwrap();
        drop(handle);
        pool.flush_file(file).unwrap();
        assert_eq!(pool.channels().open_count(), 1);

        pool.unregister(file).unwrap();
        assert_eq!(pool.channels().open_count(), 0);
        assert!(pool.file(file).is_err());
    }

    #[test]
    fn test_concurrent_writers_same_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(2);
        let file = pool.register(&path, PAGE, false).unwrap();
        let key = PageKey::new(file, 0);

        std::thread::scope(|s| {
            for t in 0..8u8 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    for round in 0..50usize {
                        let handle = pool.acquire_for_write(key).unwrap();
                        let offset = (t as usize) * 256 + (round % 32) * 8;
                        handle.write(offset, &[t + 1; 8]).unwrap();
                    }
                });
            }
        });

        pool.flush_all().unwrap();
        let on_disk = fs::read(&path).unwrap();
        for t in 0..8usize {
            assert!(on_disk[t * 256..t * 256 + 256]
                .iter()
                .all(|&b| b == t as u8 + 1));
        }
    }

    #[test]
    fn test_dirty_victim_is_written_outside_pool_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(1);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(0, b"old").unwrap();
        drop(handle);

        // Hold the victim's flush so its write-back stalls
        let victim = Arc::clone(&pool.inner.lock().frames[0]);
        let flush_guard = victim.flush_lock();

        let writer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let handle = pool.acquire_for_write(PageKey::new(file, 1)).unwrap();
                handle.write(0, b"new").unwrap();
            })
        };

        // The pool lock stays available while the write-back is blocked
        loop {
            let inner = pool
                .inner
                .try_lock_for(std::time::Duration::from_secs(5))
                .expect("pool lock held during write-back");
            if inner.table.get(PageKey::new(file, 1)).is_some() {
                assert!(inner.table.get(PageKey::new(file, 0)).is_some());
                break;
            }
            drop(inner);
            std::thread::yield_now();
        }
        assert!(pool.contains(PageKey::new(file, 1)));

        drop(flush_guard);
        writer.join().unwrap();
        assert!(!pool.contains(PageKey::new(file, 0)));
        assert_eq!(pool.stats().resident_pages, 1);
        assert_eq!(pool.stats().evictions, 1);
        assert_eq!(&fs::read(&path).unwrap()[..3], b"old");
    }

    #[test]
    fn test_failed_write_back_keeps_page() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let path = sub.join("data");
        let pool = create_test_pool(1);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        handle.write(0, b"keep").unwrap();
        drop(handle);

        // Nothing opened the file yet, so the write-back cannot create it
        fs::remove_dir_all(&sub).unwrap();
        drop(pool.acquire_for_write(PageKey::new(file, 1)).unwrap());

        let key = PageKey::new(file, 0);
        assert!(pool.contains(key));
        assert_eq!(pool.stats().evictions, 0);
        assert_eq!(pool.stats().dirty_pages, 1);
        assert!(pool.acquire_for_write(key).unwrap().is_dirty());

        fs::create_dir(&sub).unwrap();
        pool.flush_file(file).unwrap();
        assert_eq!(&fs::read(&path).unwrap()[..4], b"keep");
    }

    #[test]
    fn test_sweep_after_unregister_closes_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let pool = create_test_pool(4);
        let file = pool.register(&path, PAGE, false).unwrap();

        let handle = pool.acquire_for_write(PageKey::new(file, 0)).unwrap();
        pool.unregister(file).unwrap();
        assert_eq!(pool.channels().open_count(), 0);

        handle.write(0, b"tail").unwrap();
        drop(handle);
        assert_eq!(&fs::read(&path).unwrap()[..4], b"tail");
        assert_eq!(pool.channels().open_count(), 0);
        assert_eq!(pool.stats().resident_bytes, 0);
    }

    #[test]
    fn test_auto_sized() {
        let pool = PagePool::auto_sized();
        assert!(pool.config().capacity_bytes >= MIN_AUTO_CAPACITY);
    }
}
