//! On-disk B-tree mapping `i32` keys to `i32` values.
//!
//! Classic B-tree: every node, internal or leaf, carries key/value pairs.
//! Keys in the left subtree of a key are smaller, keys in the right subtree
//! larger. Inserting into a full node splits it at the median and promotes the
//! median pair to the parent; splitting the root adds a level.
//!
//! ## File Layout
//!
//! The file is an array of fixed-size nodes. Node 0 is the header:
//! ```text
//! +----------------------+ 0
//! | magic "I2IB"         | 4
//! | version: u32         | 8
//! | byte order tag: u8   | 9
//! | reserved: [u8; 3]    | 12
//! | max_children: u32    | 16
//! | node_size: u32       | 20
//! | root: u32            | 24
//! | height: u32          | 28
//! | node_count: u32      | 32
//! | entry_count: u64     | 40
//! +----------------------+
//! ```
//!
//! Tree nodes, with `cap = max_children - 1`:
//! ```text
//! +----------------------------+ 0
//! | tag: u8 (1 leaf, 2 inner)  | 1
//! | reserved: u8               | 2
//! | count: u16                 | 4
//! | reserved: u32              | 8
//! +----------------------------+
//! | keys: [i32; cap]           |
//! | values: [i32; cap]         |
//! | children: [u32; cap + 1]   |
//! +----------------------------+
//! ```
//!
//! Multi-byte fields use the storage byte order, recorded by the tag byte.

mod header;
mod node;
mod tree;

pub use header::{BTREE_MAGIC, BTREE_VERSION};
pub use tree::IntToIntBTree;

use enumdb_common::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Smallest supported branching factor.
pub const MIN_CHILDREN: u32 = 4;

/// Largest supported branching factor (node key count must fit a u16).
pub const MAX_CHILDREN: u32 = 4096;

/// Configuration for an int-to-int B-tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Branching factor used when the tree is created.
    ///
    /// An existing tree keeps the value stored in its header.
    pub max_children: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self { max_children: 128 }
    }
}

impl BTreeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHILDREN..=MAX_CHILDREN).contains(&self.max_children) {
            return Err(StorageError::InvalidParameter {
                name: "max_children".to_string(),
                value: self.max_children.to_string(),
            });
        }
        Ok(())
    }

    /// Bytes per node for this branching factor.
    pub fn node_size(&self) -> usize {
        node::node_size(self.max_children)
    }
}
