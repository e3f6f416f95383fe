//! enumdb common types, errors, and encodings.
//!
//! This crate provides shared definitions used across all enumdb components.

pub mod cancel;
pub mod config;
pub mod error;
pub mod page;
pub mod varint;

pub use cancel::{Cancellation, CancellationFlag, NeverCancelled};
pub use config::{StorageConfig, StorageKind};
pub use error::{Result, StorageError};
pub use page::{ByteOrder, FileId, PageKey, DEFAULT_PAGE_SIZE};
