//! Disk-backed enumerator.
//!
//! A base path `<base>` owns five files:
//! - `<base>.values`: serialized values, appended back to back
//! - `<base>.offsets`: header with state flags, then one offset per id
//! - `<base>.hashes`: B-tree from value hash to an id or a duplicate list
//! - `<base>.dups`: duplicate lists for hashes shared by several values
//! - `<base>.lock`: held while the enumerator is open
//!
//! Lookups hash the value, fetch the B-tree slot for the hash and compare
//! every candidate id's stored value with the equality policy.

use crate::codec::{Codec, EqualityPolicy};
use crate::duplicates::DuplicateLists;
use crate::enumerator::DataEnumerator;
use crate::lock::StorageLock;
use crate::value_log::{ValueLog, FLAG_CORRUPTED, FLAG_DIRTY};
use bytes::BytesMut;
use enumdb_buffer::PagePool;
use enumdb_common::{Cancellation, NeverCancelled, Result, StorageConfig, StorageError};
use enumdb_storage::{
    open_storage, BTreeConfig, IntToIntBTree, ResizeableMappedFile, DEFAULT_INITIAL_SIZE,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt::Display;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

const VALUES_SUFFIX: &str = "values";
const OFFSETS_SUFFIX: &str = "offsets";
const HASHES_SUFFIX: &str = "hashes";
const DUPLICATES_SUFFIX: &str = "dups";
const LOCK_SUFFIX: &str = "lock";

/// Configuration for a persistent enumerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumeratorConfig {
    /// Backend and layout of every file.
    pub storage: StorageConfig,
    /// Hash index shape, used when the index is created.
    pub btree: BTreeConfig,
    /// First physical allocation of the growable files.
    pub initial_file_size: u64,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            btree: BTreeConfig::default(),
            initial_file_size: DEFAULT_INITIAL_SIZE,
        }
    }
}

impl EnumeratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.btree.validate()?;
        if self.initial_file_size == 0 {
            return Err(StorageError::InvalidParameter {
                name: "initial_file_size".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Returns `<base>.<suffix>`.
pub fn sibling_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

struct State {
    log: ValueLog,
    hashes: IntToIntBTree,
    duplicates: DuplicateLists,
    dirty: bool,
}

impl State {
    /// Makes pending changes durable, then clears the dirty flag on disk.
    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.log.force()?;
        self.duplicates.force()?;
        self.hashes.force()?;
        // Flags go last so a crash before this point still reads as dirty
        let flags = self.log.flags() & !FLAG_DIRTY;
        self.log.set_flags(flags)?;
        self.log.force()?;
        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let log = self.log.close();
        let duplicates = self.duplicates.close();
        let hashes = self.hashes.close();
        log.and(duplicates).and(hashes)
    }
}

/// Outcome of looking a value up by hash.
enum Resolution {
    /// No value with this hash.
    Absent,
    Found(i32),
    /// The hash is taken by other values; carries its B-tree slot.
    Missed(i32),
}

/// Enumerator persisting values and ids under a base path.
///
/// All state sits behind one mutex. Errors met while reading stored data
/// latch the enumerator corrupted: the flag is persisted and every later call
/// fails with `Corrupted` until the files are rebuilt. Cancellation and use
/// after close never latch.
pub struct PersistentEnumerator<T, C, E> {
    base: PathBuf,
    read_only: bool,
    codec: C,
    equality: E,
    cancellation: Arc<dyn Cancellation>,
    state: Mutex<State>,
    lock: Mutex<Option<StorageLock>>,
    corrupted: AtomicBool,
    closed: AtomicBool,
    _values: PhantomData<fn() -> T>,
}

impl<T, C, E> PersistentEnumerator<T, C, E>
where
    C: Codec<T>,
    E: EqualityPolicy<T>,
{
    /// Opens or creates the enumerator at `base`.
    ///
    /// Fails with `AlreadyInUse` if another handle holds the base, and with
    /// `Corrupted` if the files were not closed cleanly or were marked
    /// corrupted.
    pub fn open(
        base: &Path,
        config: &EnumeratorConfig,
        pool: &Arc<PagePool>,
        codec: C,
        equality: E,
    ) -> Result<Self> {
        config.validate()?;
        let lock = StorageLock::acquire(sibling_path(base, LOCK_SUFFIX))?;

        let open_file = |suffix: &str| -> Result<ResizeableMappedFile> {
            let storage = open_storage(&sibling_path(base, suffix), &config.storage, pool)?;
            ResizeableMappedFile::open(storage, config.initial_file_size)
        };
        let log = ValueLog::open(open_file(VALUES_SUFFIX)?, open_file(OFFSETS_SUFFIX)?)?;
        if log.flags() & FLAG_CORRUPTED != 0 {
            return Err(StorageError::corrupted(format!(
                "enumerator {} was marked corrupted",
                base.display()
            )));
        }
        if log.flags() & FLAG_DIRTY != 0 {
            return Err(StorageError::corrupted(format!(
                "enumerator {} was not closed cleanly",
                base.display()
            )));
        }
        log.validate()?;

        let duplicates = DuplicateLists::open(open_file(DUPLICATES_SUFFIX)?)?;
        let hashes = IntToIntBTree::open(
            open_storage(&sibling_path(base, HASHES_SUFFIX), &config.storage, pool)?,
            &config.btree,
        )?;
        debug!(
            base = %base.display(),
            records = log.count(),
            lock = %lock.path().display(),
            "opened persistent enumerator"
        );

        Ok(Self {
            base: base.to_path_buf(),
            read_only: config.storage.read_only,
            codec,
            equality,
            cancellation: Arc::new(NeverCancelled),
            state: Mutex::new(State {
                log,
                hashes,
                duplicates,
                dirty: false,
            }),
            lock: Mutex::new(Some(lock)),
            corrupted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _values: PhantomData,
        })
    }

    /// Installs the check consulted by `for_each` and candidate scans.
    pub fn with_cancellation(mut self, cancellation: Arc<dyn Cancellation>) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Whether changes were made since the last force.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Latches the enumerator corrupted and records it on disk.
    pub fn mark_corrupted(&self) {
        let mut state = self.state.lock();
        self.latch_corrupted(&mut state, &"marked corrupted by caller");
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::closed(&self.base));
        }
        if self.is_corrupted() {
            return Err(StorageError::corrupted(format!(
                "enumerator {} is corrupted",
                self.base.display()
            )));
        }
        Ok(())
    }

    fn latch<R>(&self, state: &mut State, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if !e.is_cancellation() && !e.is_closed() {
                self.latch_corrupted(state, e);
            }
        }
        result
    }

    fn latch_corrupted(&self, state: &mut State, reason: &dyn Display) {
        if self.corrupted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(base = %self.base.display(), %reason, "enumerator corrupted");
        if self.read_only || self.is_closed() {
            return;
        }
        let flags = state.log.flags() | FLAG_CORRUPTED;
        if let Err(e) = state.log.set_flags(flags).and_then(|_| state.log.force()) {
            error!(base = %self.base.display(), error = %e, "failed to persist corruption flag");
        }
    }

    fn resolve(&self, state: &State, hash: i32, value: &T) -> Result<Resolution> {
        let Some(slot) = state.hashes.get(hash)? else {
            return Ok(Resolution::Absent);
        };
        let candidates = if slot > 0 {
            vec![slot]
        } else {
            let head = slot.checked_neg().filter(|&head| head > 0).ok_or_else(|| {
                StorageError::corrupted(format!("hash {hash} maps to slot {slot}"))
            })?;
            state.duplicates.ids(head, self.cancellation.as_ref())?
        };
        for id in candidates {
            self.cancellation.check_cancelled()?;
            if self.equality.equals(&self.read_value(state, id)?, value) {
                return Ok(Resolution::Found(id));
            }
        }
        Ok(Resolution::Missed(slot))
    }

    fn lookup(&self, value: &T) -> Result<Resolution> {
        let hash = self.equality.hash(value);
        let mut state = self.state.lock();
        self.check_usable()?;
        let resolved = self.resolve(&state, hash, value);
        self.latch(&mut state, resolved)
    }

    fn read_value(&self, state: &State, id: i32) -> Result<T> {
        let record = state
            .log
            .record(id)?
            .ok_or_else(|| StorageError::corrupted(format!("id {id} is not in the value log")))?;
        self.decode(id, &record)
    }

    fn decode(&self, id: i32, record: &[u8]) -> Result<T> {
        let mut input = record;
        let value = self.codec.deserialize(&mut input)?;
        if !input.is_empty() {
            return Err(StorageError::corrupted(format!(
                "record {id} has {} bytes left after decoding",
                input.len()
            )));
        }
        Ok(value)
    }

    fn mark_dirty(&self, state: &mut State) -> Result<()> {
        if !state.dirty {
            let flags = state.log.flags() | FLAG_DIRTY;
            state.log.set_flags(flags)?;
            state.log.force()?;
            state.dirty = true;
        }
        Ok(())
    }

    fn append(&self, state: &mut State, hash: i32, record: &[u8], previous: Option<i32>) -> Result<i32> {
        self.mark_dirty(state)?;
        let id = state.log.append(record)?;
        let slot = match previous {
            None => id,
            Some(single) if single > 0 => {
                let tail = state.duplicates.push(single, 0)?;
                -state.duplicates.push(id, tail)?
            }
            Some(head) => -state.duplicates.push(id, -head)?,
        };
        state.hashes.put(hash, slot)?;
        Ok(id)
    }

    /// Makes every change durable and clears the dirty flag.
    pub fn force(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(StorageError::closed(&self.base));
        }
        state.flush()
    }

    /// Flushes, closes every file and releases the lock.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = state.flush();
        let closed = state.close();
        let released = match self.lock.lock().take() {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        };
        debug!(base = %self.base.display(), "closed persistent enumerator");
        flushed.and(closed).and(released)
    }
}

impl<T, C, E> DataEnumerator<T> for PersistentEnumerator<T, C, E>
where
    C: Codec<T>,
    E: EqualityPolicy<T>,
{
    fn enumerate(&self, value: Option<&T>) -> Result<i32> {
        let Some(value) = value else {
            return Ok(0);
        };
        let hash = self.equality.hash(value);
        let mut state = self.state.lock();
        self.check_usable()?;

        let resolved = self.resolve(&state, hash, value);
        let previous = match self.latch(&mut state, resolved)? {
            Resolution::Found(id) => return Ok(id),
            Resolution::Absent => None,
            Resolution::Missed(slot) => Some(slot),
        };
        if self.read_only {
            return Err(StorageError::ReadOnly {
                path: self.base.clone(),
            });
        }

        let mut record = BytesMut::new();
        self.codec.serialize(value, &mut record)?;
        let appended = self.append(&mut state, hash, &record, previous);
        self.latch(&mut state, appended)
    }

    fn try_enumerate(&self, value: Option<&T>) -> Result<i32> {
        let Some(value) = value else {
            return Ok(0);
        };
        match self.lookup(value)? {
            Resolution::Found(id) => Ok(id),
            Resolution::Absent | Resolution::Missed(_) => Ok(0),
        }
    }

    fn value_of(&self, id: i32) -> Result<Option<T>> {
        let mut state = self.state.lock();
        self.check_usable()?;
        if id <= 0 {
            return Ok(None);
        }
        let result = state
            .log
            .record(id)
            .and_then(|record| record.map(|bytes| self.decode(id, &bytes)).transpose());
        self.latch(&mut state, result)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(i32, &T) -> bool) -> Result<bool> {
        let count = self.records_count()?;
        for id in 1..=count {
            self.cancellation.check_cancelled()?;
            // The lock is not held while the visitor runs
            let value = {
                let mut state = self.state.lock();
                self.check_usable()?;
                let value = self.read_value(&state, id);
                self.latch(&mut state, value)?
            };
            if !visitor(id, &value) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn records_count(&self) -> Result<i32> {
        let state = self.state.lock();
        self.check_usable()?;
        Ok(state.log.count() as i32)
    }
}

impl<T, C, E> Drop for PersistentEnumerator<T, C, E> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state.get_mut();
        let flushed = state.flush();
        if let Err(e) = flushed.and(state.close()) {
            error!(base = %self.base.display(), error = %e, "failed to close persistent enumerator");
        }
    }
}

impl<T, C, E> std::fmt::Debug for PersistentEnumerator<T, C, E>
where
    C: Codec<T>,
    E: EqualityPolicy<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentEnumerator")
            .field("base", &self.base)
            .field("read_only", &self.read_only)
            .field("corrupted", &self.is_corrupted())
            .field("closed", &self.is_closed())
            .finish()
    }
}
