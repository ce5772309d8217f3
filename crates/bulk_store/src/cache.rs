//! Bounded expire-after-access cache with an explicit async loader.
//!
//! Absent keys are cached as `None`, so repeated lookups of a cleared
//! request do not hit the database. The lock is only taken for in-memory
//! bookkeeping and is released before the loader runs.
//!
//! Every invalidation or in-place modification bumps an epoch. A load only
//! stores its result if the epoch is unchanged since the load began, so a
//! slow loader cannot put back a row that was invalidated meanwhile.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

struct Entry<V> {
    value: Option<V>,
    last_access: Instant,
}

struct Inner<V> {
    entries: LruCache<String, Entry<V>>,
    epoch: u64,
}

pub struct LoadingCache<V> {
    inner: Mutex<Inner<V>>,
    expiry: Duration,
}

impl<V: Clone> LoadingCache<V> {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                epoch: 0,
            }),
            expiry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value for `key`: `None` on a miss, `Some(None)` for a cached
    /// absence.
    pub fn get(&self, key: &str) -> Option<Option<V>> {
        let mut inner = self.lock();
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.last_access.elapsed() < self.expiry => {
                entry.last_access = Instant::now();
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
        }
        None
    }

    pub fn insert(&self, key: &str, value: Option<V>) {
        self.lock().entries.put(key.to_string(), Entry::new(value));
    }

    /// Mutate a cached value in place. Returns false if nothing was cached.
    ///
    /// Loads in flight are not cached.
    pub fn modify(&self, key: &str, f: impl FnOnce(&mut V)) -> bool {
        let mut inner = self.lock();
        inner.epoch += 1;
        match inner.entries.get_mut(key) {
            Some(Entry {
                value: Some(value), ..
            }) => {
                f(value);
                true
            }
            _ => false,
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.entries.pop(key);
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached value, or run `loader` and cache its result.
    ///
    /// Loader errors are returned and nothing is cached. A loaded value is
    /// returned but not cached if the cache was invalidated while loading.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let epoch = {
            if let Some(hit) = self.get(key) {
                return Ok(hit);
            }
            self.lock().epoch
        };
        let value = loader(key.to_string()).await?;

        let mut inner = self.lock();
        if inner.epoch == epoch {
            inner.entries.put(key.to_string(), Entry::new(value.clone()));
        }
        Ok(value)
    }
}

impl<V> Entry<V> {
    fn new(value: Option<V>) -> Self {
        Self {
            value,
            last_access: Instant::now(),
        }
    }
}
