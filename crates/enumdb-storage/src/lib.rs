//! Byte storage for enumdb.
//!
//! This crate provides:
//! - A common byte-addressable storage contract
//! - Paged file storage backed by the shared page pool
//! - Direct positional file I/O and a volatile in-memory storage
//! - A growth-aware file with a persisted logical length
//! - The on-disk int-to-int B-tree

mod btree;
mod in_memory;
mod paged;
mod random_access;
mod resizeable;
mod storage;

pub use btree::{BTreeConfig, IntToIntBTree, BTREE_MAGIC, BTREE_VERSION, MAX_CHILDREN, MIN_CHILDREN};
pub use in_memory::InMemoryStorage;
pub use paged::PagedFileStorage;
pub use random_access::RandomAccessStorage;
pub use resizeable::{len_file_path, ResizeableMappedFile, DEFAULT_INITIAL_SIZE};
pub use storage::{open_storage, ByteStorage};
