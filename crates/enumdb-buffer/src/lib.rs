//! Page pool management for enumdb.
//!
//! This crate provides in-memory page caching with:
//! - A byte-budgeted pool shared by every paged storage
//! - LRU eviction among unpinned pages
//! - Pin counting through RAII page handles
//! - Dirty range tracking with write-back on eviction and flush
//! - A bounded cache of open file handles

mod channel;
mod frame;
mod page_table;
mod pool;
mod recycler;
mod replacer;

pub use channel::{read_at, write_all_at, ChannelCache};
pub use frame::{FrameId, FrameState, PageFrame};
pub use pool::{FileEntry, PageHandle, PagePool, PagePoolConfig, PoolStats, WeakPageHandle};
pub use recycler::BufferRecycler;
pub use replacer::{LruReplacer, Replacer};
