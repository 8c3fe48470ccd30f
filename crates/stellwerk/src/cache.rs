//! Function memoization with canonical argument keys.
//!
//! Keys are the MessagePack encoding of the argument value, so two
//! separately constructed but equal arguments hit the same entry. At
//! capacity the oldest-inserted entry is evicted, deliberately not the
//! least recently used one.

use std::sync::Mutex;
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::{keys, MetricsCollector};

/// A cached value plus its insertion time.
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

type WrappedFn<A, T> = Box<dyn Fn(&A) -> T + Send + Sync>;

/// Memoizing wrapper around a function of one serializable argument.
///
/// `call` has the same contract as the wrapped function; the cache only
/// short-circuits repeated computation, it never changes results or
/// turns them into errors.
pub struct MemoCache<A, T> {
    name: String,
    entries: Mutex<IndexMap<Vec<u8>, CacheEntry<T>>>,
    max_entries: usize,
    func: WrappedFn<A, T>,
    metrics: MetricsCollector,
}

impl<A, T> MemoCache<A, T>
where
    A: Serialize,
    T: Clone,
{
    /// Wrap `func` with a cache holding at most `max_entries` results.
    pub fn wrap(
        name: impl Into<String>,
        max_entries: usize,
        metrics: MetricsCollector,
        func: impl Fn(&A) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(IndexMap::new()),
            max_entries,
            func: Box::new(func),
            metrics,
        }
    }

    /// Invoke the wrapped function, reusing a cached result when the
    /// argument encodes to a known key.
    pub fn call(&self, args: &A) -> T {
        let key = match rmp_serde::to_vec(args) {
            Ok(key) => key,
            Err(e) => {
                // An unencodable argument must not break the call;
                // skip memoization for it.
                self.metrics.increment(keys::CACHE_BYPASSES, 1);
                warn!(cache = %self.name, error = %e, "argument not encodable, bypassing cache");
                return (self.func)(args);
            }
        };

        if let Some(value) = self.lookup(&key) {
            self.metrics.increment(keys::CACHE_HITS, 1);
            return value;
        }

        self.metrics.increment(keys::CACHE_MISSES, 1);
        // Compute outside the lock; the function may be slow or submit
        // further work of its own.
        let value = (self.func)(args);
        self.insert(key, value.clone());
        value
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a result is cached for this argument.
    pub fn contains(&self, args: &A) -> bool {
        match rmp_serde::to_vec(args) {
            Ok(key) => self
                .entries
                .lock()
                .expect("cache lock poisoned")
                .contains_key(&key),
            Err(_) => false,
        }
    }

    fn lookup(&self, key: &[u8]) -> Option<T> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(key).map(|entry| entry.value.clone())
    }

    fn insert(&self, key: Vec<u8>, value: T) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        // A concurrent call may have inserted the same key while we were
        // computing; keep the existing entry and its age.
        if entries.contains_key(&key) {
            return;
        }

        while entries.len() >= self.max_entries {
            match entries.shift_remove_index(0) {
                Some((_, evicted)) => {
                    self.metrics.increment(keys::CACHE_EVICTIONS, 1);
                    debug!(
                        cache = %self.name,
                        entry_age_secs = evicted.inserted_at.elapsed().as_secs_f64(),
                        "evicting oldest entry"
                    );
                }
                None => break,
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }
}
