//! Page table mapping resident pages to their frames.

use crate::frame::FrameId;
use enumdb_common::page::{FileId, PageKey};
use std::collections::{BTreeSet, HashMap};

/// Maps PageKey to FrameId, with a per-file index of resident pages.
///
/// Not synchronized on its own: the pool mutates it under its table lock, which
/// also orders lookups against pinning.
#[derive(Debug, Default)]
pub struct PageTable {
    frames: HashMap<PageKey, FrameId>,
    by_file: HashMap<FileId, BTreeSet<u32>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the frame holding a page.
    #[inline]
    pub fn get(&self, key: PageKey) -> Option<FrameId> {
        self.frames.get(&key).copied()
    }

    /// Inserts a mapping, returning the frame it replaced.
    pub fn insert(&mut self, key: PageKey, frame_id: FrameId) -> Option<FrameId> {
        self.by_file
            .entry(key.file_id)
            .or_default()
            .insert(key.page_index);
        self.frames.insert(key, frame_id)
    }

    /// Removes a mapping only if it still points at `frame_id`.
    pub fn remove_if(&mut self, key: PageKey, frame_id: FrameId) -> bool {
        if self.get(key) != Some(frame_id) {
            return false;
        }
        self.remove(key);
        true
    }

    /// Removes a mapping. Returns the frame ID if it was present.
    pub fn remove(&mut self, key: PageKey) -> Option<FrameId> {
        let removed = self.frames.remove(&key)?;
        if let Some(pages) = self.by_file.get_mut(&key.file_id) {
            pages.remove(&key.page_index);
            if pages.is_empty() {
                self.by_file.remove(&key.file_id);
            }
        }
        Some(removed)
    }

    /// Returns the resident pages of a file in page order.
    pub fn pages_of(&self, file_id: FileId) -> Vec<(PageKey, FrameId)> {
        let Some(pages) = self.by_file.get(&file_id) else {
            return Vec::new();
        };
        pages
            .iter()
            .filter_map(|&page_index| {
                let key = PageKey::new(file_id, page_index);
                self.get(key).map(|frame_id| (key, frame_id))
            })
            .collect()
    }

    /// Returns every resident page.
    pub fn entries(&self) -> Vec<(PageKey, FrameId)> {
        self.frames.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
