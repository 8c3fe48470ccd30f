//! Budgeted priority scheduling.
//!
//! Four FIFO queues, one per [`Priority`] class, drained in cycles. A
//! cycle fully drains Critical, then works down High → Normal → Low
//! until the frame budget or the batch cap is hit. The run loop parks
//! on a notifier while idle instead of polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::StellwerkError;
use crate::metrics::{keys, MetricsCollector};
use crate::task::{JobOutcome, Priority, WorkItem};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Scheduler lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// All queues empty; the loop is parked awaiting a submit.
    Idle,
    /// The loop is draining cycles.
    Running,
    /// Shut down; submissions are rejected.
    Stopped,
}

/// What one drain cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Critical items executed. Never limited by budget or batch cap.
    pub critical: usize,
    /// Non-critical items executed under the cycle limits.
    pub non_critical: usize,
    /// Items whose handler returned an error or panicked.
    pub failed: usize,
    /// Items left queued when the cycle stopped.
    pub deferred: usize,
}

impl CycleReport {
    /// Total items executed this cycle.
    pub fn executed(&self) -> usize {
        self.critical + self.non_critical
    }
}

/// The priority scheduler. Owns the class queues and drains them in
/// budgeted cycles; see [`Scheduler::run_cycle`] for the drain rules.
pub struct Scheduler {
    config: SchedulerConfig,
    queues: Mutex<[VecDeque<WorkItem>; 4]>,
    /// Wakes the run loop on submit and on shutdown.
    notify: Notify,
    accepting: AtomicBool,
    state: AtomicU8,
    metrics: MetricsCollector,
}

impl Scheduler {
    /// Create a scheduler with the given cycle limits.
    pub fn new(config: SchedulerConfig, metrics: MetricsCollector) -> Self {
        Self {
            config,
            queues: Mutex::new(Default::default()),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            state: AtomicU8::new(STATE_IDLE),
            metrics,
        }
    }

    /// Enqueue an item at the tail of its class queue and wake the loop.
    ///
    /// Never blocks. Rejects synchronously, before enqueue: an item with
    /// no job attached (`InvalidWorkItem`) and any submission after
    /// shutdown (`Cancelled`).
    pub fn submit(&self, item: WorkItem) -> Result<Uuid, StellwerkError> {
        if !item.has_job() {
            return Err(StellwerkError::InvalidWorkItem(
                "work item has no job attached".into(),
            ));
        }

        let id = item.id();
        let priority = item.priority();
        let depth = {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            // Checked under the queue lock so a concurrent shutdown
            // either sees this item in its drain or rejects us here.
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(StellwerkError::Cancelled);
            }
            let queue = &mut queues[priority.index()];
            queue.push_back(item);
            queue.len()
        };

        self.metrics.set_queue_depth(priority, depth);
        debug!(item = %id, priority = %priority, depth, "work item submitted");
        self.notify.notify_one();
        Ok(id)
    }

    /// Run one budgeted drain cycle.
    ///
    /// Drains from a snapshot of the queues taken at cycle start, so
    /// handlers may submit re-entrantly; anything submitted mid-cycle
    /// waits for the next cycle. Leftovers go back to the front of the
    /// live queues, keeping FIFO order within each class across cycles.
    pub fn run_cycle(&self) -> CycleReport {
        let budget = self.config.frame_budget();
        let batch_cap = self.config.event_batch_size;
        let started = Instant::now();

        let mut snapshot = {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            [
                std::mem::take(&mut queues[0]),
                std::mem::take(&mut queues[1]),
                std::mem::take(&mut queues[2]),
                std::mem::take(&mut queues[3]),
            ]
        };

        let mut report = CycleReport::default();

        // Critical drains in full; neither limit applies.
        while let Some(item) = snapshot[Priority::Critical.index()].pop_front() {
            self.execute_item(item, &mut report);
            report.critical += 1;
        }

        'classes: for priority in [Priority::High, Priority::Normal, Priority::Low] {
            while let Some(item) = snapshot[priority.index()].pop_front() {
                self.execute_item(item, &mut report);
                report.non_critical += 1;

                if started.elapsed() >= budget {
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "frame budget exhausted, deferring remainder"
                    );
                    break 'classes;
                }
                if report.non_critical >= batch_cap {
                    debug!(batch_cap, "batch cap reached, deferring remainder");
                    break 'classes;
                }
            }
        }

        let depths = {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            for idx in 0..4 {
                while let Some(item) = snapshot[idx].pop_back() {
                    report.deferred += 1;
                    queues[idx].push_front(item);
                }
            }
            [
                queues[0].len(),
                queues[1].len(),
                queues[2].len(),
                queues[3].len(),
            ]
        };
        for priority in Priority::ALL {
            self.metrics
                .set_queue_depth(priority, depths[priority.index()]);
        }

        self.metrics.increment(keys::SCHEDULER_CYCLES, 1);
        if report.deferred > 0 {
            self.metrics
                .increment(keys::SCHEDULER_DEFERRED, report.deferred as u64);
        }
        report
    }

    fn execute_item(&self, mut item: WorkItem, report: &mut CycleReport) {
        let id = item.id();
        let priority = item.priority();
        self.metrics
            .record_duration(keys::QUEUE_WAIT, item.queued_for());

        // submit() rejects job-less items, so the job is present.
        let job = match item.take_job() {
            Some(job) => job,
            None => return,
        };

        let job_started = Instant::now();
        let outcome = job();
        let elapsed = job_started.elapsed();

        self.metrics.record_duration(keys::HANDLER, elapsed);
        self.metrics.increment(keys::SCHEDULER_PROCESSED, 1);

        match outcome {
            JobOutcome::Completed => {
                debug!(item = %id, priority = %priority, elapsed_us = elapsed.as_micros() as u64, "item completed");
            }
            JobOutcome::Failed(reason) => {
                report.failed += 1;
                self.metrics.increment(keys::SCHEDULER_FAILED, 1);
                warn!(item = %id, priority = %priority, %reason, "item handler failed");
            }
        }
    }

    /// Run the scheduling loop until shutdown.
    ///
    /// Cycles tick at the frame budget interval while work is pending;
    /// an in-progress cycle is never preempted. With empty queues the
    /// loop parks until the next submit.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.frame_budget());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            budget_ms = self.config.frame_budget_ms,
            batch_cap = self.config.event_batch_size,
            "scheduler loop starting"
        );

        loop {
            if !self.accepting.load(Ordering::SeqCst) {
                break;
            }

            if self.pending() == 0 {
                self.set_state(STATE_IDLE);
                self.notify.notified().await;
                ticker.reset();
                continue;
            }

            self.set_state(STATE_RUNNING);
            ticker.tick().await;
            let report = self.run_cycle();
            if report.executed() > 0 {
                debug!(
                    critical = report.critical,
                    non_critical = report.non_critical,
                    failed = report.failed,
                    deferred = report.deferred,
                    "cycle complete"
                );
            }
        }

        self.set_state(STATE_STOPPED);
        info!("scheduler loop stopped");
    }

    /// Stop accepting work and cancel everything still queued.
    ///
    /// Dropping each queued item resolves its completion handle with
    /// `Cancelled`. Returns the number of items cancelled; a repeated
    /// call is a no-op.
    pub fn shutdown(&self) -> usize {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return 0;
        }

        let mut drained = Vec::new();
        {
            let mut queues = self.queues.lock().expect("queue lock poisoned");
            for queue in queues.iter_mut() {
                drained.extend(queue.drain(..));
            }
        }
        let cancelled = drained.len();
        drop(drained);

        if cancelled > 0 {
            self.metrics
                .increment(keys::SCHEDULER_CANCELLED, cancelled as u64);
        }
        for priority in Priority::ALL {
            self.metrics.set_queue_depth(priority, 0);
        }
        self.notify.notify_one();

        info!(cancelled, "scheduler shut down");
        cancelled
    }

    /// Total queued items across all classes.
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock().expect("queue lock poisoned");
        queues.iter().map(|q| q.len()).sum()
    }

    /// Queued items in one class.
    pub fn depth(&self, priority: Priority) -> usize {
        let queues = self.queues.lock().expect("queue lock poisoned");
        queues[priority.index()].len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => SchedulerState::Running,
            STATE_STOPPED => SchedulerState::Stopped,
            _ => SchedulerState::Idle,
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_scheduler(batch: usize, budget_ms: u64) -> Scheduler {
        Scheduler::new(
            SchedulerConfig {
                event_batch_size: batch,
                frame_budget_ms: budget_ms,
            },
            MetricsCollector::new(),
        )
    }

    fn recording_item(
        priority: Priority,
        label: &'static str,
        order: &Arc<Mutex<Vec<&'static str>>>,
    ) -> WorkItem {
        let order = Arc::clone(order);
        let (item, _completion) = WorkItem::new(priority, move || {
            order.lock().unwrap().push(label);
            Ok(())
        });
        item
    }

    #[test]
    fn submit_rejects_blank_items() {
        let scheduler = test_scheduler(64, 100);
        let err = scheduler
            .submit(WorkItem::blank(Priority::Normal))
            .unwrap_err();
        assert!(matches!(err, StellwerkError::InvalidWorkItem(_)));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_cancelled() {
        let scheduler = test_scheduler(64, 100);
        scheduler.shutdown();

        let (item, _completion) = WorkItem::new(Priority::Critical, || Ok(()));
        let err = scheduler.submit(item).unwrap_err();
        assert!(matches!(err, StellwerkError::Cancelled));
    }

    #[test]
    fn cycle_drains_classes_in_priority_order() {
        let scheduler = test_scheduler(64, 1_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Submit in scrambled order; drain order must follow class rank.
        for (priority, label) in [
            (Priority::Low, "low"),
            (Priority::Normal, "normal"),
            (Priority::Critical, "critical"),
            (Priority::High, "high"),
        ] {
            scheduler
                .submit(recording_item(priority, label, &order))
                .unwrap();
        }

        let report = scheduler.run_cycle();
        assert_eq!(report.executed(), 4);
        assert_eq!(report.deferred, 0);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high", "normal", "low"]
        );
    }

    #[test]
    fn fifo_within_a_class() {
        let scheduler = test_scheduler(64, 1_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            scheduler
                .submit(recording_item(Priority::Normal, label, &order))
                .unwrap();
        }

        scheduler.run_cycle();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn critical_is_exempt_from_the_batch_cap() {
        let scheduler = test_scheduler(2, 1_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            scheduler
                .submit(recording_item(Priority::Critical, "c", &order))
                .unwrap();
        }
        for _ in 0..3 {
            scheduler
                .submit(recording_item(Priority::Normal, "n", &order))
                .unwrap();
        }

        let report = scheduler.run_cycle();
        assert_eq!(report.critical, 4);
        assert_eq!(report.non_critical, 2);
        assert_eq!(report.deferred, 1);
        assert_eq!(scheduler.depth(Priority::Normal), 1);
    }

    #[test]
    fn budget_defers_the_remainder() {
        // 2ms handlers against a 5ms budget: two Critical always run
        // (6ms, exempt), then exactly one Normal fits before the
        // post-item budget check trips.
        let scheduler = test_scheduler(64, 5);
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow_item = |priority, label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            let (item, _completion) = WorkItem::new(priority, move || {
                std::thread::sleep(Duration::from_millis(2));
                order.lock().unwrap().push(label);
                Ok(())
            });
            item
        };

        for _ in 0..2 {
            scheduler
                .submit(slow_item(Priority::Critical, "c", &order))
                .unwrap();
        }
        for _ in 0..4 {
            scheduler
                .submit(slow_item(Priority::Normal, "n", &order))
                .unwrap();
        }

        let report = scheduler.run_cycle();
        assert_eq!(report.critical, 2);
        assert_eq!(report.non_critical, 1);
        assert_eq!(report.deferred, 3);

        // A later cycle picks up where this one stopped.
        let report = scheduler.run_cycle();
        assert_eq!(report.critical, 0);
        assert_eq!(report.non_critical + report.deferred, 3);
    }

    #[test]
    fn mid_cycle_submissions_wait_for_the_next_cycle() {
        let scheduler = Arc::new(test_scheduler(64, 1_000));
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_order = Arc::clone(&order);
        let resubmit = Arc::clone(&scheduler);
        let (item, _completion) = WorkItem::new(Priority::Normal, move || {
            inner_order.lock().unwrap().push("outer");
            let late_order = Arc::clone(&inner_order);
            let (late, _late_completion) = WorkItem::new(Priority::Critical, move || {
                late_order.lock().unwrap().push("late-critical");
                Ok(())
            });
            resubmit.submit(late)?;
            Ok(())
        });
        scheduler.submit(item).unwrap();

        let report = scheduler.run_cycle();
        assert_eq!(report.executed(), 1);
        assert_eq!(scheduler.depth(Priority::Critical), 1);

        let report = scheduler.run_cycle();
        assert_eq!(report.critical, 1);
        assert_eq!(*order.lock().unwrap(), vec!["outer", "late-critical"]);
    }

    #[test]
    fn deferred_items_run_before_later_submissions() {
        let scheduler = test_scheduler(1, 1_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        scheduler
            .submit(recording_item(Priority::Normal, "a", &order))
            .unwrap();
        scheduler
            .submit(recording_item(Priority::Normal, "b", &order))
            .unwrap();

        scheduler.run_cycle(); // runs a, defers b
        scheduler
            .submit(recording_item(Priority::Normal, "c", &order))
            .unwrap();
        scheduler.run_cycle(); // must run b, not c

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn failed_item_does_not_disturb_neighbors() {
        let scheduler = test_scheduler(64, 1_000);

        let (ok_before, before) = WorkItem::new(Priority::Normal, || Ok(1));
        let (bad, failing) = WorkItem::new::<i32, _>(Priority::Normal, || {
            Err(StellwerkError::JobFailed("expected failure".into()))
        });
        let (ok_after, after) = WorkItem::new(Priority::Normal, || Ok(3));

        scheduler.submit(ok_before).unwrap();
        scheduler.submit(bad).unwrap();
        scheduler.submit(ok_after).unwrap();

        let report = scheduler.run_cycle();
        assert_eq!(report.executed(), 3);
        assert_eq!(report.failed, 1);

        assert_eq!(before.wait().await.unwrap(), 1);
        assert!(matches!(
            failing.wait().await,
            Err(StellwerkError::JobFailed(_))
        ));
        assert_eq!(after.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn panicking_item_is_contained() {
        let scheduler = test_scheduler(64, 1_000);

        let (bad, failing) =
            WorkItem::new::<(), _>(Priority::High, || panic!("handler blew up"));
        let (ok, fine) = WorkItem::new(Priority::High, || Ok(()));

        scheduler.submit(bad).unwrap();
        scheduler.submit(ok).unwrap();

        let report = scheduler.run_cycle();
        assert_eq!(report.executed(), 2);
        assert_eq!(report.failed, 1);

        assert!(matches!(
            failing.wait().await,
            Err(StellwerkError::JobFailed(_))
        ));
        assert!(fine.wait().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_items() {
        let scheduler = test_scheduler(64, 1_000);

        let (a, first) = WorkItem::new(Priority::Normal, || Ok(()));
        let (b, second) = WorkItem::new(Priority::Low, || Ok(()));
        scheduler.submit(a).unwrap();
        scheduler.submit(b).unwrap();

        assert_eq!(scheduler.shutdown(), 2);
        assert_eq!(scheduler.pending(), 0);

        assert!(matches!(first.wait().await, Err(StellwerkError::Cancelled)));
        assert!(matches!(second.wait().await, Err(StellwerkError::Cancelled)));

        // Second shutdown is a no-op.
        assert_eq!(scheduler.shutdown(), 0);
    }

    #[test]
    fn queue_depth_metrics_track_submissions() {
        let metrics = MetricsCollector::new();
        let scheduler = Scheduler::new(
            SchedulerConfig {
                event_batch_size: 64,
                frame_budget_ms: 100,
            },
            metrics.clone(),
        );

        let (item, _completion) = WorkItem::new(Priority::High, || Ok(()));
        scheduler.submit(item).unwrap();

        assert_eq!(metrics.snapshot().queue_depths[&Priority::High], 1);
        scheduler.run_cycle();
        assert_eq!(metrics.snapshot().queue_depths[&Priority::High], 0);
        assert_eq!(metrics.snapshot().processed, 1);
    }
}
