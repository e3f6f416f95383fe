//! B-tree header node.

use enumdb_common::{ByteOrder, Result, StorageError};

/// File magic.
pub const BTREE_MAGIC: [u8; 4] = *b"I2IB";

/// On-disk format version.
pub const BTREE_VERSION: u32 = 1;

/// Encoded header size; every node is at least this large.
pub(crate) const HEADER_SIZE: usize = 40;

/// Decoded header of an int-to-int B-tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    pub max_children: u32,
    pub node_size: u32,
    pub root: u32,
    pub height: u32,
    pub node_count: u32,
    pub entry_count: u64,
}

impl TreeHeader {
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&BTREE_MAGIC);
        order.write_u32(&mut buf, 4, BTREE_VERSION);
        buf[8] = order.tag();
        order.write_u32(&mut buf, 12, self.max_children);
        order.write_u32(&mut buf, 16, self.node_size);
        order.write_u32(&mut buf, 20, self.root);
        order.write_u32(&mut buf, 24, self.height);
        order.write_u32(&mut buf, 28, self.node_count);
        buf[32..40].copy_from_slice(&order.encode_i64(self.entry_count as i64));
        buf
    }

    /// Decodes and checks the fixed fields of a header.
    pub fn decode(buf: &[u8; HEADER_SIZE], order: ByteOrder) -> Result<Self> {
        if buf[0..4] != BTREE_MAGIC {
            return Err(StorageError::corrupted(format!(
                "bad B-tree magic {:02x?}",
                &buf[0..4]
            )));
        }
        match ByteOrder::from_tag(buf[8]) {
            Some(stored) if stored == order => {}
            Some(stored) => {
                return Err(StorageError::corrupted(format!(
                    "B-tree written as {stored:?}, opened as {order:?}"
                )))
            }
            None => {
                return Err(StorageError::corrupted(format!(
                    "unknown byte order tag {}",
                    buf[8]
                )))
            }
        }
        let version = order.read_u32(buf, 4);
        if version != BTREE_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: BTREE_VERSION,
                actual: version,
            });
        }

        let mut entry_count = [0u8; 8];
        entry_count.copy_from_slice(&buf[32..40]);
        Ok(Self {
            max_children: order.read_u32(buf, 12),
            node_size: order.read_u32(buf, 16),
            root: order.read_u32(buf, 20),
            height: order.read_u32(buf, 24),
            node_count: order.read_u32(buf, 28),
            entry_count: order.decode_i64(entry_count) as u64,
        })
    }
}
