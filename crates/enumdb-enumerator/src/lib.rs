//! Value-to-id enumerators for enumdb.
//!
//! This crate provides:
//! - The `DataEnumerator` contract and the codec/equality seams it relies on
//! - A persistent enumerator over a value log, an offset index, a hash B-tree
//!   and duplicate lists
//! - A striped LRU cache usable in front of any enumerator
//! - A volatile in-memory enumerator

mod caching;
mod codec;
mod duplicates;
mod enumerator;
mod in_memory;
mod lock;
mod persistent;
mod value_log;

pub use caching::{CacheConfig, CacheStats, CachingEnumerator};
pub use codec::{polynomial_hash, BytesCodec, Codec, ContentEquality, EqualityPolicy, StringCodec};
pub use enumerator::DataEnumerator;
pub use in_memory::InMemoryEnumerator;
pub use persistent::{sibling_path, EnumeratorConfig, PersistentEnumerator};
pub use value_log::{FLAG_CORRUPTED, FLAG_DIRTY, OFFSETS_MAGIC, OFFSETS_VERSION};

/// Persistent enumerator of UTF-8 strings.
pub type StringEnumerator = PersistentEnumerator<String, StringCodec, ContentEquality>;
