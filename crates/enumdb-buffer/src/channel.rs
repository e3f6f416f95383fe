//! Shared cache of open file handles.
//!
//! Every storage goes through the same [`ChannelCache`], so two storages on
//! one path share a descriptor and the process never holds more than
//! `max_open_files` handles. Idle handles are closed in least-recently-used
//! order; a handle being used by another thread stays alive through its `Arc`
//! until that operation returns.

use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Number of times an interrupted operation is retried on a fresh handle.
const MAX_INTERRUPT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    path: PathBuf,
    read_only: bool,
}

/// Bounded, LRU-ordered cache of open files keyed by path and access mode.
pub struct ChannelCache {
    open: Mutex<LruCache<ChannelKey, Arc<File>>>,
}

impl ChannelCache {
    /// Creates a cache keeping at most `max_open_files` handles open.
    pub fn new(max_open_files: usize) -> Self {
        let capacity = NonZeroUsize::new(max_open_files).unwrap_or(NonZeroUsize::MIN);
        Self {
            open: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns an open handle for `path`, opening it if needed.
    ///
    /// Writable handles create the file. Read-only handles require it to exist.
    pub fn channel(&self, path: &Path, read_only: bool) -> io::Result<Arc<File>> {
        let key = ChannelKey {
            path: path.to_path_buf(),
            read_only,
        };
        let mut open = self.open.lock();
        if let Some(file) = open.get(&key) {
            return Ok(Arc::clone(file));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        let file = Arc::new(file);
        if let Some((evicted, _)) = open.push(key, Arc::clone(&file)) {
            trace!(path = %evicted.path.display(), "closed idle file handle");
        }
        Ok(file)
    }

    /// Runs `op` against the handle for `path`.
    ///
    /// An `Interrupted` failure closes the handle and retries on a freshly
    /// opened one, a bounded number of times. Other errors are returned as is.
    pub fn execute<T>(
        &self,
        path: &Path,
        read_only: bool,
        mut op: impl FnMut(&File) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            let file = self.channel(path, read_only)?;
            match op(&file) {
                Err(e) if e.kind() == ErrorKind::Interrupted && attempt < MAX_INTERRUPT_RETRIES => {
                    attempt += 1;
                    debug!(path = %path.display(), attempt, "file operation interrupted, reopening");
                    self.close_channel(path, read_only);
                }
                result => return result,
            }
        }
    }

    /// Drops the cached handle for one access mode of `path`.
    pub fn close_channel(&self, path: &Path, read_only: bool) {
        let key = ChannelKey {
            path: path.to_path_buf(),
            read_only,
        };
        self.open.lock().pop(&key);
    }

    /// Drops every cached handle for `path`.
    pub fn close_all_for(&self, path: &Path) {
        let mut open = self.open.lock();
        for read_only in [false, true] {
            open.pop(&ChannelKey {
                path: path.to_path_buf(),
                read_only,
            });
        }
    }

    /// Number of handles currently cached.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.open.lock().cap().get()
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("open", &self.open_count())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Reads into `buf` starting at `offset`, stopping early only at end of file.
///
/// Returns the number of bytes read; the rest of `buf` is left untouched.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match positional_read(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes all of `buf` at `offset`.
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match positional_write(file, &buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => written += n,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_channel_shared_per_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.dat");
        let cache = ChannelCache::new(4);

        let first = cache.channel(&path, false).unwrap();
        let second = cache.channel(&path, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.open_count(), 1);
        assert!(path.exists());
    }

    #[test]
    fn test_channel_lru_bound() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);

        for name in ["a", "b", "c"] {
            cache.channel(&dir.path().join(name), false).unwrap();
        }
        assert_eq!(cache.open_count(), 2);

        // "a" was closed but can be reopened transparently
        let reopened = cache.channel(&dir.path().join("a"), false).unwrap();
        assert_eq!(reopened.metadata().unwrap().len(), 0);
        assert_eq!(cache.open_count(), 2);
    }

    #[test]
    fn test_evicted_handle_stays_usable() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(1);
        let path = dir.path().join("held.dat");

        let held = cache.channel(&path, false).unwrap();
        cache.channel(&dir.path().join("other.dat"), false).unwrap();

        write_all_at(&held, b"still open", 0).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(read_at(&held, &mut buf, 0).unwrap(), 10);
        assert_eq!(&buf, b"still open");
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);
        let err = cache
            .channel(&dir.path().join("missing"), true)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_read_at_stops_at_eof() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);
        let path = dir.path().join("short.dat");

        cache
            .execute(&path, false, |f| write_all_at(f, &[7u8; 100], 0))
            .unwrap();

        let mut buf = [0u8; 256];
        let n = cache
            .execute(&path, true, |f| read_at(f, &mut buf, 50))
            .unwrap();
        assert_eq!(n, 50);
        assert!(buf[..50].iter().all(|&b| b == 7));
        assert!(buf[50..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_execute_retries_interrupted() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);
        let path = dir.path().join("retry.dat");

        let mut calls = 0;
        let result = cache.execute(&path, false, |_| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(ErrorKind::Interrupted))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_execute_gives_up_after_retries() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(2);
        let path = dir.path().join("stuck.dat");

        let mut calls = 0;
        let result: io::Result<()> = cache.execute(&path, false, |_| {
            calls += 1;
            Err(io::Error::from(ErrorKind::Interrupted))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Interrupted);
        assert_eq!(calls, MAX_INTERRUPT_RETRIES + 1);
    }

    #[test]
    fn test_close_all_for() {
        let dir = tempdir().unwrap();
        let cache = ChannelCache::new(4);
        let path = dir.path().join("both.dat");

        cache.channel(&path, false).unwrap();
        cache.channel(&path, true).unwrap();
        assert_eq!(cache.open_count(), 2);

        cache.close_all_for(&path);
        assert_eq!(cache.open_count(), 0);
    }
}
