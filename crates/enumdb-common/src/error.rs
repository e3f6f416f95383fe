//! Error types for enumdb storages.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in enumdb operations.
///
/// The variants separate lifecycle misuse (`Closed`) from on-disk damage
/// (`Corrupted`, `VersionMismatch`) so callers can decide whether the storage
/// has to be rebuilt.
#[derive(Debug, Error)]
pub enum StorageError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Storage is closed: {}", path.display())]
    Closed { path: PathBuf },

    #[error("Storage is read-only: {}", path.display())]
    ReadOnly { path: PathBuf },

    #[error("Storage is already in use: {}", path.display())]
    AlreadyInUse { path: PathBuf },

    // Corruption errors
    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    #[error("Storage version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Access out of bounds: offset {offset}, length {len}")]
    OutOfBounds { offset: u64, len: u64 },

    // Value errors
    #[error("Codec error: {0}")]
    Codec(String),

    // Control flow
    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

impl StorageError {
    /// Creates a closed-storage error for the given path.
    pub fn closed(path: impl Into<PathBuf>) -> Self {
        StorageError::Closed { path: path.into() }
    }

    /// Creates a corruption error from any displayable reason.
    pub fn corrupted(reason: impl std::fmt::Display) -> Self {
        StorageError::Corrupted(reason.to_string())
    }

    /// Returns true if the on-disk data must be treated as invalid.
    ///
    /// A version mismatch counts as corruption: the stored format can't be
    /// read by this code, the caller either migrates or rebuilds.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted(_) | StorageError::VersionMismatch { .. }
        )
    }

    /// Returns true if the storage was used after its lifecycle ended.
    pub fn is_closed(&self) -> bool {
        matches!(self, StorageError::Closed { .. })
    }

    /// Returns true if the error is a caller-requested abort.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}
