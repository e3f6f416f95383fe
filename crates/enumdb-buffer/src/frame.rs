//! Page frame management.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use enumdb_common::page::PageKey;

/// Sentinel value indicating no page is installed in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Packed value of an empty modified region.
const EMPTY_REGION: u64 = 0;

/// Unique identifier for a frame in the page pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Lifecycle of a frame.
///
/// `Free -> Usable -> AboutToUnmap -> PreTombstone -> Free`, or straight
/// `Usable -> PreTombstone` when the pool evicts an unpinned page. Only the
/// thread that wins the transition into `PreTombstone` tears the page down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Slot holds no page.
    Free = 0,
    /// Page is installed and can be pinned.
    Usable = 1,
    /// Page left the page table while still pinned; the last unpin sweeps it.
    AboutToUnmap = 2,
    /// One thread is flushing and releasing the page.
    PreTombstone = 3,
}

impl FrameState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FrameState::Usable,
            2 => FrameState::AboutToUnmap,
            3 => FrameState::PreTombstone,
            _ => FrameState::Free,
        }
    }
}

/// Records which bytes of a never-loaded page were written, one bit per byte.
#[derive(Debug, Clone)]
pub struct WriteBitmap {
    words: Vec<u64>,
    len: usize,
    set: usize,
}

impl WriteBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64)],
            len,
            set: 0,
        }
    }

    /// Marks `[start, end)` as written.
    pub fn mark(&mut self, start: usize, end: usize) {
        let end = end.min(self.len);
        let mut i = start;
        while i < end {
            let word = i / 64;
            let bit = i % 64;
            let span = (64 - bit).min(end - i);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            let before = self.words[word].count_ones();
            self.words[word] |= mask;
            self.set += (self.words[word].count_ones() - before) as usize;
            i += span;
        }
    }

    #[inline]
    pub fn is_written(&self, index: usize) -> bool {
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Returns true once every byte of the page was written.
    pub fn is_full(&self) -> bool {
        self.set == self.len
    }

    /// Number of written bytes.
    pub fn written_len(&self) -> usize {
        self.set
    }

    /// Returns maximal `[start, end)` runs whose bytes are all `written` (or all not).
    pub fn runs(&self, written: bool) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut start = None;
        for i in 0..self.len {
            match (self.is_written(i) == written, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push((s, i));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s, self.len));
        }
        runs
    }
}

/// Buffer and write tracking of one page, guarded by the frame's RwLock.
#[derive(Debug, Default)]
pub struct PageData {
    /// Page bytes.
    pub bytes: Vec<u8>,
    /// Bytes written before the page was read from disk.
    pub written: Option<WriteBitmap>,
}

/// A slot of the page pool arena holding a single page.
///
/// Each frame contains:
/// - The page buffer behind a per-page RwLock
/// - Pin count, dirty region and lifecycle state for the pool
pub struct PageFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently installed (packed PageKey, NO_PAGE = none).
    /// Only changed while holding the data write lock.
    key: AtomicU64,
    /// Page data buffer.
    data: RwLock<PageData>,
    /// Number of live handles to this page.
    pin_count: AtomicU32,
    /// Lifecycle state (FrameState as u8).
    state: AtomicU8,
    /// Modified region `[min, max)` packed as `(max << 32) | min`.
    modified: AtomicU64,
    /// Whether disk content has been merged into the buffer.
    loaded: AtomicBool,
    /// Serializes flushes of this frame.
    flush_lock: Mutex<()>,
}

impl PageFrame {
    /// Creates a new empty frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            key: AtomicU64::new(NO_PAGE),
            data: RwLock::new(PageData::default()),
            pin_count: AtomicU32::new(0),
            state: AtomicU8::new(FrameState::Free as u8),
            modified: AtomicU64::new(EMPTY_REGION),
            loaded: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page currently installed in this frame.
    #[inline]
    pub fn key(&self) -> Option<PageKey> {
        let packed = self.key.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageKey::from_u64(packed))
        }
    }

    /// Installs a page with a fresh buffer. The frame must be free.
    ///
    /// The pin count is left alone: a weak handle may be checking the frame and
    /// owes it an unpin.
    pub fn install(&self, key: PageKey, buffer: Vec<u8>) {
        let mut data = self.data.write();
        data.bytes = buffer;
        data.written = None;
        self.key.store(key.as_u64(), Ordering::Release);
        self.modified.store(EMPTY_REGION, Ordering::Release);
        self.loaded.store(false, Ordering::Release);
        self.state.store(FrameState::Usable as u8, Ordering::SeqCst);
    }

    /// Detaches the page and hands its buffer back to the caller.
    pub fn reset(&self) -> Vec<u8> {
        let mut data = self.data.write();
        let buffer = std::mem::take(&mut data.bytes);
        data.written = None;
        self.key.store(NO_PAGE, Ordering::Release);
        self.modified.store(EMPTY_REGION, Ordering::Release);
        self.loaded.store(false, Ordering::Release);
        self.state.store(FrameState::Free as u8, Ordering::SeqCst);
        buffer
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrements the pin count.
    ///
    /// Returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::SeqCst);
            return 0;
        }
        prev - 1
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves from `from` to `to` if the frame is still in `from`.
    #[inline]
    pub fn try_transition(&self, from: FrameState, to: FrameState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns true if the page has unflushed modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.modified.load(Ordering::Acquire) != EMPTY_REGION
    }

    /// Returns the modified region `[min, max)` if the page is dirty.
    pub fn modified_region(&self) -> Option<(usize, usize)> {
        let packed = self.modified.load(Ordering::Acquire);
        if packed == EMPTY_REGION {
            None
        } else {
            Some(((packed as u32) as usize, (packed >> 32) as usize))
        }
    }

    /// Widens the modified region to include `[start, start + len)`.
    ///
    /// Callers hold the data write lock.
    pub fn mark_modified(&self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        let end = (start + len) as u64;
        let start = start as u64;
        let _ = self
            .modified
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (min, max) = if packed == EMPTY_REGION {
                    (start, end)
                } else {
                    ((packed & 0xFFFF_FFFF).min(start), (packed >> 32).max(end))
                };
                Some((max << 32) | min)
            });
    }

    /// Restricts the modified region to bytes before `limit`.
    pub fn clamp_modified(&self, limit: usize) {
        let limit = limit as u64;
        let _ = self
            .modified
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                if packed == EMPTY_REGION {
                    return None;
                }
                let min = packed & 0xFFFF_FFFF;
                let max = (packed >> 32).min(limit);
                if max <= min {
                    Some(EMPTY_REGION)
                } else {
                    Some((max << 32) | min)
                }
            });
    }

    #[inline]
    pub fn clear_modified(&self) {
        self.modified.store(EMPTY_REGION, Ordering::Release);
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Changed only while holding the data write lock.
    #[inline]
    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }

    #[inline]
    pub fn flush_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("frame_id", &self.frame_id)
            .field("key", &self.key())
            .field("pin_count", &self.pin_count())
            .field("state", &self.state())
            .field("modified", &self.modified_region())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
