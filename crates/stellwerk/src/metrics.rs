//! Metrics collection for the scheduling subsystem.
//!
//! Provides counters, gauges, and per-category duration averages behind a
//! cheaply clonable collector handle, plus consistent point-in-time
//! snapshots and a background report task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::task::Priority;

/// Well-known metric names shared by producers and the snapshot.
pub mod keys {
    pub const SCHEDULER_PROCESSED: &str = "scheduler.processed";
    pub const SCHEDULER_FAILED: &str = "scheduler.failed";
    pub const SCHEDULER_CANCELLED: &str = "scheduler.cancelled";
    pub const SCHEDULER_CYCLES: &str = "scheduler.cycles";
    pub const SCHEDULER_DEFERRED: &str = "scheduler.deferred";

    pub const DISPATCH_OFFLOADED: &str = "dispatch.offloaded";
    pub const DISPATCH_COMPLETED: &str = "dispatch.completed";
    pub const DISPATCH_FAILED: &str = "dispatch.failed";
    pub const DISPATCH_CANCELLED: &str = "dispatch.cancelled";
    pub const DISPATCH_REJECTED: &str = "dispatch.rejected";

    /// Gauge: units currently alive.
    pub const DISPATCH_LIVE_UNITS: &str = "dispatch.live_units";
    /// Gauge: units currently processing a task.
    pub const DISPATCH_BUSY_UNITS: &str = "dispatch.busy_units";
    /// Gauge: tasks waiting for an idle unit.
    pub const DISPATCH_QUEUED: &str = "dispatch.queued";

    pub const CACHE_HITS: &str = "cache.hits";
    pub const CACHE_MISSES: &str = "cache.misses";
    pub const CACHE_EVICTIONS: &str = "cache.evictions";
    pub const CACHE_BYPASSES: &str = "cache.bypasses";

    pub const POOL_MISSES: &str = "pool.misses";
    pub const POOL_DISCARDS: &str = "pool.discards";

    /// Duration category: submit-to-execution queue wait.
    pub const QUEUE_WAIT: &str = "scheduler.queue_wait";
    /// Duration category: handler execution time.
    pub const HANDLER: &str = "scheduler.handler";
    /// Duration category: offload-to-reply round trip.
    pub const DISPATCH_ROUNDTRIP: &str = "dispatch.roundtrip";
}

// ── Aggregates ───────────────────────────────────────────────────────

/// Count plus incremental average for one duration category.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub avg: Duration,
}

impl DurationStats {
    /// Fold one observation into the running average.
    ///
    /// Incremental mean: `new_avg = prev_avg + (x - prev_avg) / count`.
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        if self.count == 1 {
            self.avg = elapsed;
        } else {
            let prev_nanos = self.avg.as_nanos() as f64;
            let cur_nanos = elapsed.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.count as f64;
            self.avg = Duration::from_nanos(avg_nanos as u64);
        }
    }
}

/// Free/in-use occupancy reported by a resource pool.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub free: usize,
}

impl PoolStats {
    /// Fraction of known objects currently out with callers.
    pub fn utilization(&self) -> f64 {
        let total = self.in_use + self.free;
        if total == 0 {
            0.0
        } else {
            self.in_use as f64 / total as f64
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Consistent point-in-time copy of all aggregates.
///
/// Reading a snapshot never resets anything; counters are monotonic
/// across consecutive snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: f64,
    /// Items waiting per priority class.
    pub queue_depths: HashMap<Priority, usize>,
    /// Total items executed by the scheduler.
    pub processed: u64,
    /// Items whose handler returned an error or panicked.
    pub failed: u64,
    /// Hits / (hits + misses) across all memoization caches.
    pub cache_hit_ratio: f64,
    /// In-use fraction per named resource pool.
    pub pool_utilization: HashMap<String, f64>,
    pub durations: HashMap<String, DurationStats>,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
}

// ── MetricsCollector ─────────────────────────────────────────────────

/// Inner mutable state protected by a mutex.
#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    durations: HashMap<String, DurationStats>,
    queue_depths: HashMap<Priority, usize>,
    pools: HashMap<String, PoolStats>,
}

/// Thread-safe metrics collector for the scheduling subsystem.
///
/// All methods are synchronous and lock-scoped so they can be called
/// from async tasks and worker unit threads alike.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
    start: Instant,
}

impl MetricsCollector {
    /// Create a new collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            start: Instant::now(),
        }
    }

    /// Add `delta` to a named counter.
    pub fn increment(&self, key: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner.counters.entry(key.to_string()).or_default() += delta;
    }

    /// Fold one duration observation into a category average.
    pub fn record_duration(&self, category: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .durations
            .entry(category.to_string())
            .or_default()
            .record(elapsed);
    }

    /// Set a named gauge to an absolute value.
    pub fn set_gauge(&self, key: &str, value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.gauges.insert(key.to_string(), value);
    }

    /// Record the current depth of one priority queue.
    pub fn set_queue_depth(&self, priority: Priority, depth: usize) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.queue_depths.insert(priority, depth);
    }

    /// Record the current occupancy of a named pool.
    pub fn set_pool_stats(&self, pool: &str, stats: PoolStats) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.pools.insert(pool.to_string(), stats);
    }

    /// Current value of a counter (0 when never incremented).
    pub fn counter(&self, key: &str) -> u64 {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.counters.get(key).copied().unwrap_or_default()
    }

    /// Build a consistent snapshot of all aggregates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");

        let hits = inner.counters.get(keys::CACHE_HITS).copied().unwrap_or(0);
        let misses = inner
            .counters
            .get(keys::CACHE_MISSES)
            .copied()
            .unwrap_or(0);
        let cache_hit_ratio = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let pool_utilization = inner
            .pools
            .iter()
            .map(|(name, stats)| (name.clone(), stats.utilization()))
            .collect();

        MetricsSnapshot {
            generated_at: Utc::now(),
            uptime_secs: self.start.elapsed().as_secs_f64(),
            queue_depths: inner.queue_depths.clone(),
            processed: inner
                .counters
                .get(keys::SCHEDULER_PROCESSED)
                .copied()
                .unwrap_or(0),
            failed: inner
                .counters
                .get(keys::SCHEDULER_FAILED)
                .copied()
                .unwrap_or(0),
            cache_hit_ratio,
            pool_utilization,
            durations: inner.durations.clone(),
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ── Report task ──────────────────────────────────────────────────────

/// Spawn the background task that logs a snapshot summary at `interval`.
pub fn spawn_report_task(
    collector: MetricsCollector,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first
        // report carries a full interval of data.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = collector.snapshot();
                    info!(
                        processed = snap.processed,
                        failed = snap.failed,
                        cache_hit_ratio = snap.cache_hit_ratio,
                        uptime_secs = snap.uptime_secs,
                        "metrics report"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.increment(keys::SCHEDULER_PROCESSED, 1);
        collector.increment(keys::SCHEDULER_PROCESSED, 2);

        let snap = collector.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.counters[keys::SCHEDULER_PROCESSED], 3);
    }

    #[test]
    fn duration_average_is_incremental() {
        let collector = MetricsCollector::new();
        collector.record_duration(keys::HANDLER, Duration::from_millis(100));
        collector.record_duration(keys::HANDLER, Duration::from_millis(200));

        let snap = collector.snapshot();
        let stats = snap.durations[keys::HANDLER];
        assert_eq!(stats.count, 2);
        // Average of 100ms and 200ms = 150ms
        let avg = stats.avg.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn cache_hit_ratio_from_counters() {
        let collector = MetricsCollector::new();
        collector.increment(keys::CACHE_HITS, 3);
        collector.increment(keys::CACHE_MISSES, 1);

        let snap = collector.snapshot();
        assert!((snap.cache_hit_ratio - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_ratio_without_traffic_is_zero() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.cache_hit_ratio, 0.0);
    }

    #[test]
    fn queue_depths_and_gauges() {
        let collector = MetricsCollector::new();
        collector.set_queue_depth(Priority::Critical, 2);
        collector.set_queue_depth(Priority::Low, 7);
        collector.set_gauge("dispatch.queued", 4.0);

        let snap = collector.snapshot();
        assert_eq!(snap.queue_depths[&Priority::Critical], 2);
        assert_eq!(snap.queue_depths[&Priority::Low], 7);
        assert_eq!(snap.gauges["dispatch.queued"], 4.0);
    }

    #[test]
    fn pool_utilization_in_snapshot() {
        let collector = MetricsCollector::new();
        collector.set_pool_stats("buffers", PoolStats { in_use: 3, free: 1 });

        let snap = collector.snapshot();
        assert!((snap.pool_utilization["buffers"] - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_pool_utilization_is_zero() {
        let stats = PoolStats::default();
        assert_eq!(stats.utilization(), 0.0);
    }

    #[test]
    fn snapshot_does_not_reset() {
        let collector = MetricsCollector::new();
        collector.increment(keys::SCHEDULER_PROCESSED, 5);

        let first = collector.snapshot();
        let second = collector.snapshot();
        assert_eq!(first.processed, 5);
        assert_eq!(second.processed, 5);
    }

    #[test]
    fn concurrent_recording_is_race_free() {
        let collector = MetricsCollector::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = collector.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    c.increment(keys::SCHEDULER_PROCESSED, 1);
                    c.record_duration(keys::HANDLER, Duration::from_micros(10));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = collector.snapshot();
        assert_eq!(snap.processed, 400);
        assert_eq!(snap.durations[keys::HANDLER].count, 400);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let collector = MetricsCollector::new();
        collector.increment(keys::CACHE_HITS, 1);
        collector.set_queue_depth(Priority::Normal, 1);

        let json = serde_json::to_string(&collector.snapshot()).unwrap();
        assert!(json.contains("cache_hit_ratio"));
        assert!(json.contains("Normal"));
    }
}
