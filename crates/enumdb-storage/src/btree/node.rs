//! B-tree node encoding.

use super::header::HEADER_SIZE;
use enumdb_common::{ByteOrder, Result, StorageError};

const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;

/// Tag, pad, count and pad before the key array.
const NODE_HEADER_SIZE: usize = 8;

/// Bytes per node for a branching factor.
pub(crate) fn node_size(max_children: u32) -> usize {
    let cap = max_children as usize - 1;
    (NODE_HEADER_SIZE + cap * 8 + (cap + 1) * 4).max(HEADER_SIZE)
}

/// A decoded tree node.
///
/// Leaves keep `children` empty; internal nodes hold `keys.len() + 1`
/// children. Between a decode and the next encode the vectors may hold one
/// element above capacity while a split is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub index: u32,
    pub keys: Vec<i32>,
    pub values: Vec<i32>,
    pub children: Vec<u32>,
}

impl Node {
    pub fn new_leaf(index: u32) -> Self {
        Self {
            index,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Encodes into a `node_size` buffer.
    pub fn encode(&self, max_children: u32, order: ByteOrder, buf: &mut [u8]) {
        let cap = max_children as usize - 1;
        buf.fill(0);
        buf[0] = if self.is_leaf() { TAG_LEAF } else { TAG_INTERNAL };
        order.write_u16(buf, 2, self.keys.len() as u16);

        let keys_at = NODE_HEADER_SIZE;
        let values_at = keys_at + cap * 4;
        let children_at = values_at + cap * 4;
        for (i, (&key, &value)) in self.keys.iter().zip(&self.values).enumerate() {
            order.write_i32(buf, keys_at + i * 4, key);
            order.write_i32(buf, values_at + i * 4, value);
        }
        for (i, &child) in self.children.iter().enumerate() {
            order.write_u32(buf, children_at + i * 4, child);
        }
    }

    /// Decodes and validates a node.
    ///
    /// Child indexes must fall in `1..node_count`; anything else means the
    /// file is damaged.
    pub fn decode(
        index: u32,
        buf: &[u8],
        max_children: u32,
        node_count: u32,
        order: ByteOrder,
    ) -> Result<Self> {
        let cap = max_children as usize - 1;
        let leaf = match buf[0] {
            TAG_LEAF => true,
            TAG_INTERNAL => false,
            tag => {
                return Err(StorageError::corrupted(format!(
                    "node {index} has bad tag {tag}"
                )))
            }
        };
        let count = order.read_u16(buf, 2) as usize;
        if count > cap {
            return Err(StorageError::corrupted(format!(
                "node {index} holds {count} keys, capacity is {cap}"
            )));
        }
        if !leaf && count == 0 {
            return Err(StorageError::corrupted(format!(
                "internal node {index} has no keys"
            )));
        }

        let keys_at = NODE_HEADER_SIZE;
        let values_at = keys_at + cap * 4;
        let children_at = values_at + cap * 4;
        let keys = (0..count)
            .map(|i| order.read_i32(buf, keys_at + i * 4))
            .collect();
        let values = (0..count)
            .map(|i| order.read_i32(buf, values_at + i * 4))
            .collect();
        let children = if leaf {
            Vec::new()
        } else {
            (0..=count)
                .map(|i| {
                    let child = order.read_u32(buf, children_at + i * 4);
                    if child == 0 || child >= node_count {
                        Err(StorageError::corrupted(format!(
                            "node {index} points at node {child}, tree has {node_count}"
                        )))
                    } else {
                        Ok(child)
                    }
                })
                .collect::<Result<Vec<u32>>>()?
        };

        Ok(Self {
            index,
            keys,
            values,
            children,
        })
    }
}
