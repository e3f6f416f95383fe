//! Configuration structures shared by enumdb storages.

use crate::error::Result;
use crate::page::{validate_page_size, ByteOrder, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Backend used for a byte storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageKind {
    /// Pages cached in the shared page pool.
    #[default]
    PagedFile,
    /// Direct positional reads and writes on the file.
    RandomAccessFile,
    /// Heap-backed bytes, nothing touches the disk.
    InMemory,
}

/// Configuration for a single byte storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selected at construction.
    pub kind: StorageKind,
    /// Page size in bytes (power of two).
    pub page_size: usize,
    /// Byte order of every multi-byte value.
    pub byte_order: ByteOrder,
    /// Reject writes.
    pub read_only: bool,
    /// Call fsync when the storage is forced.
    pub sync_on_force: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::PagedFile,
            page_size: DEFAULT_PAGE_SIZE,
            byte_order: ByteOrder::BigEndian,
            read_only: false,
            sync_on_force: true,
        }
    }
}

impl StorageConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)
    }

    /// Returns a copy with a different page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns a copy with a different backend.
    pub fn with_kind(mut self, kind: StorageKind) -> Self {
        self.kind = kind;
        self
    }
}
