//! Page addressing and byte order for enumdb storages.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (64 KB).
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Smallest page size accepted by the page pool.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted by the page pool (16 MB).
pub const MAX_PAGE_SIZE: usize = 16 * 1024 * 1024;

/// Identifier of a file registered with the page pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Unique identifier for a page: owning file plus page index within the file.
///
/// The page covers the byte range `[page_index * page_size, (page_index + 1) * page_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageKey {
    /// Registered file the page belongs to.
    pub file_id: FileId,
    /// Page number within the file (0-indexed).
    pub page_index: u32,
}

impl PageKey {
    /// Creates a new PageKey.
    pub fn new(file_id: FileId, page_index: u32) -> Self {
        Self {
            file_id,
            page_index,
        }
    }

    /// Returns the PageKey as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.file_id.0 as u64) << 32) | (self.page_index as u64)
    }

    /// Creates a PageKey from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            file_id: FileId((value >> 32) as u32),
            page_index: value as u32,
        }
    }

    /// Returns the file offset of the first byte of this page.
    pub fn offset(&self, page_size: usize) -> u64 {
        self.page_index as u64 * page_size as u64
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id.0, self.page_index)
    }
}

/// Checks that a page size is a power of two within the supported range.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(StorageError::InvalidParameter {
            name: "page_size".to_string(),
            value: page_size.to_string(),
        });
    }
    Ok(())
}

/// Splits an absolute offset into (page index, offset within page).
#[inline]
pub fn split_offset(offset: u64, page_size: usize) -> (u32, usize) {
    let page_size = page_size as u64;
    ((offset / page_size) as u32, (offset % page_size) as usize)
}

/// Byte order used for every multi-byte value of a storage.
///
/// Fixed when the storage is created. Structures that persist their own
/// header record the order tag so a file is only reinterpreted on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Most significant byte first (portable default).
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

impl ByteOrder {
    /// Returns the byte order of the running platform.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    /// Tag byte persisted in file headers.
    pub const fn tag(self) -> u8 {
        match self {
            ByteOrder::BigEndian => 1,
            ByteOrder::LittleEndian => 2,
        }
    }

    /// Parses a persisted tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ByteOrder::BigEndian),
            2 => Some(ByteOrder::LittleEndian),
            _ => None,
        }
    }

    #[inline]
    pub fn encode_i32(self, value: i32) -> [u8; 4] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    #[inline]
    pub fn decode_i32(self, bytes: [u8; 4]) -> i32 {
        match self {
            ByteOrder::BigEndian => i32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => i32::from_le_bytes(bytes),
        }
    }

    #[inline]
    pub fn encode_i64(self, value: i64) -> [u8; 8] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    #[inline]
    pub fn decode_i64(self, bytes: [u8; 8]) -> i64 {
        match self {
            ByteOrder::BigEndian => i64::from_be_bytes(bytes),
            ByteOrder::LittleEndian => i64::from_le_bytes(bytes),
        }
    }

    /// Reads an i32 at `pos` of a slice.
    #[inline]
    pub fn read_i32(self, buf: &[u8], pos: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[pos..pos + 4]);
        self.decode_i32(bytes)
    }

    /// Writes an i32 at `pos` of a slice.
    #[inline]
    pub fn write_i32(self, buf: &mut [u8], pos: usize, value: i32) {
        buf[pos..pos + 4].copy_from_slice(&self.encode_i32(value));
    }

    /// Reads a u32 at `pos` of a slice.
    #[inline]
    pub fn read_u32(self, buf: &[u8], pos: usize) -> u32 {
        self.read_i32(buf, pos) as u32
    }

    /// Writes a u32 at `pos` of a slice.
    #[inline]
    pub fn write_u32(self, buf: &mut [u8], pos: usize, value: u32) {
        self.write_i32(buf, pos, value as i32);
    }

    /// Reads a u16 at `pos` of a slice.
    #[inline]
    pub fn read_u16(self, buf: &[u8], pos: usize) -> u16 {
        let bytes = [buf[pos], buf[pos + 1]];
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    /// Writes a u16 at `pos` of a slice.
    #[inline]
    pub fn write_u16(self, buf: &mut [u8], pos: usize, value: u16) {
        let bytes = match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        };
        buf[pos..pos + 2].copy_from_slice(&bytes);
    }
}
