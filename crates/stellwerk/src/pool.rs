//! Object-recycling pool with a hard retention cap.
//!
//! Objects move by ownership: `acquire` hands the object out, `release`
//! takes it back. The pool grows on demand (an empty-pool acquire
//! constructs a fresh object and counts a miss) and never retains more
//! than `max_size` free objects; releases past the cap discard.

use std::sync::Mutex;

use tracing::debug;

use crate::metrics::{keys, MetricsCollector, PoolStats};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Sanitizer<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Free list plus outstanding count, kept coherent under one lock.
struct PoolInner<T> {
    free: Vec<T>,
    in_use: usize,
}

/// A bounded recycling pool for frequently created objects.
///
/// Double-releasing an object the pool did not hand out is a caller bug
/// the pool cannot detect; the count simply saturates.
pub struct ResourcePool<T> {
    name: String,
    inner: Mutex<PoolInner<T>>,
    max_size: usize,
    factory: Factory<T>,
    sanitizer: Sanitizer<T>,
    metrics: MetricsCollector,
}

impl<T> ResourcePool<T> {
    /// Create a pool that constructs with `factory` and scrubs returned
    /// objects with `sanitizer` before they are handed out again.
    pub fn new(
        name: impl Into<String>,
        max_size: usize,
        metrics: MetricsCollector,
        factory: impl Fn() -> T + Send + Sync + 'static,
        sanitizer: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_use: 0,
            }),
            max_size,
            factory: Box::new(factory),
            sanitizer: Box::new(sanitizer),
            metrics,
        }
    }

    /// Take an object, recycling a free one or constructing fresh.
    ///
    /// Never fails: an empty pool is a miss, not an error.
    pub fn acquire(&self) -> T {
        let (obj, missed, stats) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let recycled = inner.free.pop();
            let missed = recycled.is_none();
            inner.in_use += 1;
            (
                recycled,
                missed,
                PoolStats {
                    in_use: inner.in_use,
                    free: inner.free.len(),
                },
            )
        };

        self.metrics.set_pool_stats(&self.name, stats);
        if missed {
            self.metrics.increment(keys::POOL_MISSES, 1);
            debug!(pool = %self.name, "pool empty, constructing new object");
        }

        obj.unwrap_or_else(|| (self.factory)())
    }

    /// Return an object to the pool.
    ///
    /// The sanitizer always runs, so stale state never leaks between
    /// uses. If the pool already holds `max_size` free objects the
    /// object is dropped instead of retained.
    pub fn release(&self, mut obj: T) {
        (self.sanitizer)(&mut obj);

        let (discarded, stats) = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.in_use = inner.in_use.saturating_sub(1);
            let discarded = if inner.free.len() < self.max_size {
                inner.free.push(obj);
                false
            } else {
                drop(obj);
                true
            };
            (
                discarded,
                PoolStats {
                    in_use: inner.in_use,
                    free: inner.free.len(),
                },
            )
        };

        self.metrics.set_pool_stats(&self.name, stats);
        if discarded {
            self.metrics.increment(keys::POOL_DISCARDS, 1);
            debug!(pool = %self.name, max_size = self.max_size, "pool full, discarding released object");
        }
    }

    /// Number of free objects currently retained.
    pub fn free_count(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").free.len()
    }

    /// Number of objects currently out with callers.
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").in_use
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        PoolStats {
            in_use: inner.in_use,
            free: inner.free.len(),
        }
    }
}
