//! Append-only value log with its id-to-offset index.
//!
//! ## Offset Index Layout
//!
//! ```text
//! +----------------------+ 0
//! | magic "ENMO"         | 4
//! | version: u32         | 8
//! | byte order tag: u8   | 9
//! | padding              | 12
//! | flags: u32           | 16
//! | count: u32           | 20
//! | reserved             | 24
//! +----------------------+
//! | offset of id 1: i64  |
//! | offset of id 2: i64  |
//! | ...                  |
//! +----------------------+
//! ```
//!
//! Record `id` spans from its offset to the offset of `id + 1`, or to the end
//! of the log for the last id.

use enumdb_common::{ByteOrder, Result, StorageError};
use enumdb_storage::ResizeableMappedFile;
use tracing::debug;

pub const OFFSETS_MAGIC: [u8; 4] = *b"ENMO";
pub const OFFSETS_VERSION: u32 = 1;

/// Set by the first modification, cleared by a clean force or close.
pub const FLAG_DIRTY: u32 = 1;
/// Set once the enumerator latched itself corrupted.
pub const FLAG_CORRUPTED: u32 = 1 << 1;

const HEADER_SIZE: u64 = 24;
const VERSION_AT: u64 = 4;
const ORDER_AT: usize = 8;
const FLAGS_AT: u64 = 12;
const COUNT_AT: u64 = 16;
const OFFSET_SIZE: u64 = 8;

pub(crate) struct ValueLog {
    values: ResizeableMappedFile,
    offsets: ResizeableMappedFile,
    order: ByteOrder,
    flags: u32,
    count: u32,
}

impl ValueLog {
    /// Opens the log, writing a fresh header into an empty index.
    pub fn open(values: ResizeableMappedFile, offsets: ResizeableMappedFile) -> Result<Self> {
        let order = offsets.storage().byte_order();
        let mut log = Self {
            values,
            offsets,
            order,
            flags: 0,
            count: 0,
        };
        if log.offsets.is_empty() {
            log.write_header()?;
        } else {
            log.read_header()?;
        }
        debug!(
            path = %log.offsets.path().display(),
            count = log.count,
            flags = log.flags,
            "opened value log"
        );
        Ok(log)
    }

    fn write_header(&self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&OFFSETS_MAGIC);
        self.order
            .write_u32(&mut header, VERSION_AT as usize, OFFSETS_VERSION);
        header[ORDER_AT] = self.order.tag();
        self.order.write_u32(&mut header, FLAGS_AT as usize, self.flags);
        self.order.write_u32(&mut header, COUNT_AT as usize, self.count);
        self.offsets.write(0, &header)
    }

    fn read_header(&mut self) -> Result<()> {
        if self.offsets.len() < HEADER_SIZE {
            return Err(StorageError::corrupted(format!(
                "offset index {} is {} bytes, shorter than its header",
                self.offsets.path().display(),
                self.offsets.len()
            )));
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        self.offsets.read(0, &mut header)?;
        if header[0..4] != OFFSETS_MAGIC {
            return Err(StorageError::corrupted(format!(
                "bad offset index magic {:02x?}",
                &header[0..4]
            )));
        }
        match ByteOrder::from_tag(header[ORDER_AT]) {
            Some(stored) if stored == self.order => {}
            Some(stored) => {
                return Err(StorageError::corrupted(format!(
                    "offset index written as {stored:?}, opened as {:?}",
                    self.order
                )))
            }
            None => {
                return Err(StorageError::corrupted(format!(
                    "unknown byte order tag {}",
                    header[ORDER_AT]
                )))
            }
        }
        let version = self.order.read_u32(&header, VERSION_AT as usize);
        if version != OFFSETS_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: OFFSETS_VERSION,
                actual: version,
            });
        }
        self.flags = self.order.read_u32(&header, FLAGS_AT as usize);
        self.count = self.order.read_u32(&header, COUNT_AT as usize);
        Ok(())
    }

    /// Checks that the index and the log agree with each other.
    ///
    /// Called after the state flags were found clean.
    pub fn validate(&self) -> Result<()> {
        let needed = HEADER_SIZE + self.count as u64 * OFFSET_SIZE;
        if self.offsets.len() < needed {
            return Err(StorageError::corrupted(format!(
                "offset index holds {} bytes, {} ids need {needed}",
                self.offsets.len(),
                self.count
            )));
        }
        if self.count > 0 {
            let last = self.offset_of(self.count)?;
            if last > self.values.len() {
                return Err(StorageError::corrupted(format!(
                    "last record starts at {last}, log ends at {}",
                    self.values.len()
                )));
            }
        }
        Ok(())
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Persists new state flags.
    pub fn set_flags(&mut self, flags: u32) -> Result<()> {
        self.flags = flags;
        let mut buf = [0u8; 4];
        self.order.write_u32(&mut buf, 0, flags);
        self.offsets.write(FLAGS_AT, &buf)
    }

    /// Number of records, equal to the highest id issued.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Appends a record and returns its id.
    pub fn append(&mut self, record: &[u8]) -> Result<i32> {
        let id = self
            .count
            .checked_add(1)
            .filter(|&id| id <= i32::MAX as u32)
            .ok_or_else(|| StorageError::InvalidParameter {
                name: "id".to_string(),
                value: "id space exhausted".to_string(),
            })?;
        let offset = self.values.append(record)?;
        self.offsets
            .put_i64(Self::slot(id), offset as i64)?;

        let mut buf = [0u8; 4];
        self.order.write_u32(&mut buf, 0, id);
        self.offsets.write(COUNT_AT, &buf)?;
        self.count = id;
        Ok(id as i32)
    }

    fn slot(id: u32) -> u64 {
        HEADER_SIZE + (id as u64 - 1) * OFFSET_SIZE
    }

    fn offset_of(&self, id: u32) -> Result<u64> {
        let offset = self.offsets.get_i64(Self::slot(id))?;
        u64::try_from(offset)
            .map_err(|_| StorageError::corrupted(format!("record {id} has offset {offset}")))
    }

    /// Reads the bytes of record `id`, or `None` for ids never issued.
    pub fn record(&self, id: i32) -> Result<Option<Vec<u8>>> {
        if id <= 0 || id as u32 > self.count {
            return Ok(None);
        }
        let id = id as u32;
        let start = self.offset_of(id)?;
        let end = if id == self.count {
            self.values.len()
        } else {
            self.offset_of(id + 1)?
        };
        if end < start || end > self.values.len() {
            return Err(StorageError::corrupted(format!(
                "record {id} spans {start}..{end}, log ends at {}",
                self.values.len()
            )));
        }
        let mut buf = vec![0u8; (end - start) as usize];
        self.values.read(start, &mut buf)?;
        Ok(Some(buf))
    }

    /// Makes the log durable, then the index.
    pub fn force(&self) -> Result<()> {
        self.values.force()?;
        self.offsets.force()
    }

    pub fn close(&self) -> Result<()> {
        let values = self.values.close();
        let offsets = self.offsets.close();
        values.and(offsets)
    }
}
