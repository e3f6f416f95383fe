//! Striped LRU caching in front of another enumerator.

use crate::codec::EqualityPolicy;
use crate::enumerator::DataEnumerator;
use enumdb_common::{Result, StorageError};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shape of the caches kept by a [`CachingEnumerator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Independent stripes per cache.
    pub stripes: usize,
    /// Entries kept per stripe.
    pub capacity_per_stripe: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stripes: 16,
            capacity_per_stripe: 1024,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stripes == 0 {
            return Err(StorageError::InvalidParameter {
                name: "stripes".to_string(),
                value: "0".to_string(),
            });
        }
        if self.capacity_per_stripe == 0 {
            return Err(StorageError::InvalidParameter {
                name: "capacity_per_stripe".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Hit and miss counters of a caching enumerator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Fixed set of independently locked LRU caches.
struct Striped<K, V> {
    stripes: Vec<Mutex<LruCache<K, V>>>,
}

impl<K: std::hash::Hash + Eq, V> Striped<K, V> {
    fn new(stripes: usize, capacity: NonZeroUsize) -> Self {
        Self {
            stripes: (0..stripes)
                .map(|_| Mutex::new(LruCache::new(capacity)))
                .collect(),
        }
    }

    fn stripe(&self, selector: i32) -> &Mutex<LruCache<K, V>> {
        &self.stripes[selector as u32 as usize % self.stripes.len()]
    }

    fn clear(&self) {
        for stripe in &self.stripes {
            stripe.lock().clear();
        }
    }
}

/// Caches both directions of another enumerator.
///
/// Values are cached by hash and checked with the equality policy before a
/// hit is trusted. Each cache access locks a single stripe and releases it
/// before touching the other cache or the backing enumerator. Entries are
/// advisory; dropping them never changes results.
pub struct CachingEnumerator<T, E, D> {
    inner: D,
    equality: E,
    by_value: Striped<i32, (T, i32)>,
    by_id: Striped<i32, T>,
    hits: AtomicU64,
    misses: AtomicU64,
    _values: PhantomData<fn() -> T>,
}

impl<T, E, D> CachingEnumerator<T, E, D>
where
    T: Clone + Send,
    E: EqualityPolicy<T>,
    D: DataEnumerator<T>,
{
    pub fn new(inner: D, equality: E, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.capacity_per_stripe).ok_or_else(|| {
            StorageError::InvalidParameter {
                name: "capacity_per_stripe".to_string(),
                value: "0".to_string(),
            }
        })?;
        Ok(Self {
            inner,
            equality,
            by_value: Striped::new(config.stripes, capacity),
            by_id: Striped::new(config.stripes, capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            _values: PhantomData,
        })
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.by_value.clear();
        self.by_id.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn cached_id(&self, hash: i32, value: &T) -> Option<i32> {
        let mut stripe = self.by_value.stripe(hash).lock();
        match stripe.get(&hash) {
            Some((cached, id)) if self.equality.equals(cached, value) => Some(*id),
            _ => None,
        }
    }

    fn remember(&self, hash: i32, value: &T, id: i32) {
        self.by_value
            .stripe(hash)
            .lock()
            .put(hash, (value.clone(), id));
        self.by_id.stripe(id).lock().put(id, value.clone());
    }

    fn count(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup(&self, value: &T, assign: bool) -> Result<i32> {
        let hash = self.equality.hash(value);
        if let Some(id) = self.cached_id(hash, value) {
            self.count(true);
            return Ok(id);
        }
        self.count(false);
        let id = if assign {
            self.inner.enumerate(Some(value))?
        } else {
            self.inner.try_enumerate(Some(value))?
        };
        if id != 0 {
            self.remember(hash, value, id);
        }
        Ok(id)
    }
}

impl<T, E, D> DataEnumerator<T> for CachingEnumerator<T, E, D>
where
    T: Clone + Send,
    E: EqualityPolicy<T>,
    D: DataEnumerator<T>,
{
    fn enumerate(&self, value: Option<&T>) -> Result<i32> {
        match value {
            Some(value) => self.lookup(value, true),
            None => Ok(0),
        }
    }

    fn try_enumerate(&self, value: Option<&T>) -> Result<i32> {
        match value {
            Some(value) => self.lookup(value, false),
            None => Ok(0),
        }
    }

    fn value_of(&self, id: i32) -> Result<Option<T>> {
        if id <= 0 {
            return Ok(None);
        }
        let cached = self.by_id.stripe(id).lock().get(&id).cloned();
        if let Some(value) = cached {
            self.count(true);
            return Ok(Some(value));
        }
        self.count(false);
        let value = self.inner.value_of(id)?;
        if let Some(value) = &value {
            self.remember(self.equality.hash(value), value, id);
        }
        Ok(value)
    }

    fn for_each(&self, visitor: &mut dyn FnMut(i32, &T) -> bool) -> Result<bool> {
        self.inner.for_each(visitor)
    }

    fn records_count(&self) -> Result<i32> {
        self.inner.records_count()
    }
}
