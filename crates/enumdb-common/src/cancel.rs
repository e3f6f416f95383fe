//! Cancellation hooks for long-running scans.

use crate::error::{Result, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};

/// Injectable check that lets a host abort an in-flight scan.
///
/// Implementations return `Err(StorageError::Cancelled)` when the caller asked
/// to stop. The signal is control flow, storages never mark themselves
/// corrupted because of it.
pub trait Cancellation: Send + Sync {
    fn check_cancelled(&self) -> Result<()>;
}

/// Cancellation that never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    #[inline]
    fn check_cancelled(&self) -> Result<()> {
        Ok(())
    }
}

/// Cancellation driven by a shared flag.
#[derive(Debug, Default)]
pub struct CancellationFlag {
    cancelled: AtomicBool,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every scan checking this flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clears a previous request.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Cancellation for CancellationFlag {
    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_cancelled() {
        assert!(NeverCancelled.check_cancelled().is_ok());
    }

    #[test]
    fn test_flag_cancel_and_reset() {
        let flag = CancellationFlag::new();
        assert!(flag.check_cancelled().is_ok());

        flag.cancel();
        let err = flag.check_cancelled().unwrap_err();
        assert!(err.is_cancellation());

        flag.reset();
        assert!(flag.check_cancelled().is_ok());
    }
}
