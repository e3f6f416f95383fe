//! Page replacement policies for the page pool.

use crate::frame::FrameId;
use lru::LruCache;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Selects a victim frame for eviction and stops tracking it.
    ///
    /// Frames rejected by `can_evict` (pinned pages, pages being torn down)
    /// are skipped but stay tracked. Returns None if no frame qualifies.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of tracked frames.
    fn size(&self) -> usize;
}

/// Least-recently-used replacement.
///
/// Every access moves the frame to the most recent end. Victims are searched
/// from the least recent end, so a pinned page at the tail only costs a skip.
pub struct LruReplacer {
    order: Mutex<LruCache<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Returns the least recently used frame without evicting it.
    pub fn peek_lru(&self) -> Option<FrameId> {
        self.order.lock().peek_lru().map(|(frame_id, _)| *frame_id)
    }
}

impl Default for LruReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Replacer for LruReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.order.lock().put(frame_id, ());
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut order = self.order.lock();
        let victim = order
            .iter()
            .rev()
            .map(|(frame_id, _)| *frame_id)
            .find(|frame_id| can_evict(*frame_id))?;
        order.pop(&victim);
        Some(victim)
    }

    fn remove(&self, frame_id: FrameId) {
        self.order.lock().pop(&frame_id);
    }

    fn size(&self) -> usize {
        self.order.lock().len()
    }
}
