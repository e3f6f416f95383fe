//! Reuse of page buffers released by evicted and swept pages.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Pool of zeroed page buffers grouped by size.
///
/// Retains at most `max_cached_bytes` worth of buffers; anything beyond that
/// is simply dropped.
#[derive(Debug)]
pub struct BufferRecycler {
    inner: Mutex<RecyclerInner>,
    max_cached_bytes: usize,
}

#[derive(Debug, Default)]
struct RecyclerInner {
    by_size: HashMap<usize, Vec<Vec<u8>>>,
    cached_bytes: usize,
}

impl BufferRecycler {
    pub fn new(max_cached_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(RecyclerInner::default()),
            max_cached_bytes,
        }
    }

    /// Returns a zero-filled buffer of exactly `size` bytes.
    pub fn allocate(&self, size: usize) -> Vec<u8> {
        let recycled = {
            let mut inner = self.inner.lock();
            let buffer = inner.by_size.get_mut(&size).and_then(Vec::pop);
            if buffer.is_some() {
                inner.cached_bytes -= size;
            }
            buffer
        };
        recycled.unwrap_or_else(|| vec![0u8; size])
    }

    /// Hands a buffer back for reuse.
    pub fn release(&self, mut buffer: Vec<u8>) {
        let size = buffer.len();
        if size == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.cached_bytes + size > self.max_cached_bytes {
            return;
        }
        buffer.fill(0);
        inner.cached_bytes += size;
        inner.by_size.entry(size).or_default().push(buffer);
    }

    /// Bytes currently held for reuse.
    pub fn cached_bytes(&self) -> usize {
        self.inner.lock().cached_bytes
    }
}
