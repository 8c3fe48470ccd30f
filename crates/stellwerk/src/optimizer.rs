//! The assembled subsystem: scheduler, dispatcher, caches, pools, and
//! metrics behind one handle.
//!
//! [`Optimizer::new`] validates the configuration, starts the scheduler
//! loop and the worker units, and wires everything to one shared
//! [`MetricsCollector`]. Callers submit prioritized jobs, offload
//! requests to the units, and mint memoization caches and resource
//! pools sized from the configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::MemoCache;
use crate::config::StellwerkConfig;
use crate::dispatch::Dispatcher;
use crate::error::StellwerkError;
use crate::metrics::{spawn_report_task, MetricsCollector, MetricsSnapshot};
use crate::pool::ResourcePool;
use crate::scheduler::Scheduler;
use crate::task::{Completion, Priority, WorkItem};
use crate::unit::UnitWorker;

pub struct Optimizer<W: UnitWorker> {
    config: StellwerkConfig,
    metrics: MetricsCollector,
    scheduler: Arc<Scheduler>,
    dispatcher: Dispatcher<W>,
    terminated: AtomicBool,
    /// Flipped at terminate to stop the background report task.
    shutdown_tx: watch::Sender<bool>,
    scheduler_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    _report_handle: Option<tokio::task::JoinHandle<()>>,
}

impl<W: UnitWorker> Optimizer<W> {
    /// Validate `config` and bring the whole subsystem up.
    ///
    /// Spawns the scheduler loop, `dispatch.worker_count` worker units
    /// running `worker`, and (unless disabled) the metrics report task.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: StellwerkConfig, worker: W) -> Result<Self, StellwerkError> {
        config.validate()?;

        let metrics = MetricsCollector::new();

        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), metrics.clone()));
        let loop_scheduler = Arc::clone(&scheduler);
        let scheduler_handle = tokio::spawn(async move { loop_scheduler.run().await });

        let unit_count = config.dispatch.resolved_worker_count();
        let dispatcher = Dispatcher::new(Arc::new(worker), unit_count, metrics.clone());
        dispatcher.initialize()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let report_handle = config
            .metrics
            .report_interval()
            .map(|interval| spawn_report_task(metrics.clone(), interval, shutdown_rx));

        info!(
            units = unit_count,
            budget_ms = config.scheduler.frame_budget_ms,
            "optimizer started"
        );

        Ok(Self {
            config,
            metrics,
            scheduler,
            dispatcher,
            terminated: AtomicBool::new(false),
            shutdown_tx,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            _report_handle: report_handle,
        })
    }

    /// Queue a prioritized job on the scheduler.
    ///
    /// The job runs on a scheduler cycle in priority order; its result
    /// arrives on the returned handle. Fails with `Cancelled` after
    /// [`Optimizer::terminate`].
    pub fn submit<T, F>(
        &self,
        priority: Priority,
        job: F,
    ) -> Result<Completion<T>, StellwerkError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StellwerkError> + Send + 'static,
    {
        let (item, completion) = WorkItem::new(priority, job);
        self.scheduler.submit(item)?;
        Ok(completion)
    }

    /// Hand a request to the worker units. Never blocks; see
    /// [`Dispatcher::offload`] for how the handle resolves.
    pub fn offload(&self, request: W::Request) -> Completion<W::Response> {
        self.dispatcher.offload(request)
    }

    /// Respawn a dead worker unit by slot index.
    pub fn restart_unit(&self, unit_id: usize) -> Result<(), StellwerkError> {
        self.dispatcher.restart_unit(unit_id)
    }

    /// Memoize `func` behind a cache capped at `cache.max_entries`.
    pub fn memo_cache<A, T>(
        &self,
        name: impl Into<String>,
        func: impl Fn(&A) -> T + Send + Sync + 'static,
    ) -> MemoCache<A, T>
    where
        A: Serialize,
        T: Clone,
    {
        MemoCache::wrap(name, self.config.cache.max_entries, self.metrics.clone(), func)
    }

    /// Create a resource pool capped at `pool.max_size` free objects.
    pub fn resource_pool<T>(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> T + Send + Sync + 'static,
        sanitizer: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> ResourcePool<T> {
        ResourcePool::new(
            name,
            self.config.pool.max_size,
            self.metrics.clone(),
            factory,
            sanitizer,
        )
    }

    /// The collector every subsystem reports into.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Consistent point-in-time view of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &StellwerkConfig {
        &self.config
    }

    /// Stop everything: cancel queued scheduler items, cancel dispatch
    /// tasks, stop the report task, and wait for the scheduler loop to
    /// exit. Idempotent; pending handles resolve `Cancelled`.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!("optimizer already terminated");
            return;
        }

        let cancelled = self.scheduler.shutdown();
        self.dispatcher.terminate();
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .scheduler_handle
            .lock()
            .expect("scheduler handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!(cancelled, "optimizer terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::scheduler::SchedulerState;

    struct EchoWorker;

    impl UnitWorker for EchoWorker {
        type Request = String;
        type Response = String;

        fn process(&self, request: String) -> Result<String, StellwerkError> {
            Ok(request)
        }
    }

    fn two_unit_config() -> StellwerkConfig {
        StellwerkConfig {
            dispatch: DispatchConfig { worker_count: 2 },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut config = two_unit_config();
        config.scheduler.frame_budget_ms = 0;
        assert!(matches!(
            Optimizer::new(config, EchoWorker),
            Err(StellwerkError::Config(_))
        ));
    }

    #[tokio::test]
    async fn submit_and_offload_round_trip() {
        let optimizer = Optimizer::new(two_unit_config(), EchoWorker).unwrap();

        let scheduled = optimizer
            .submit(Priority::High, || Ok::<_, StellwerkError>(7 * 6))
            .unwrap();
        assert_eq!(scheduled.wait().await.unwrap(), 42);

        let offloaded = optimizer.offload("hello".to_string());
        assert_eq!(offloaded.wait().await.unwrap(), "hello");

        optimizer.terminate().await;
    }

    #[tokio::test]
    async fn terminate_stops_the_scheduler_loop() {
        let optimizer = Optimizer::new(two_unit_config(), EchoWorker).unwrap();
        optimizer.terminate().await;
        assert_eq!(optimizer.scheduler().state(), SchedulerState::Stopped);
        assert!(matches!(
            optimizer.submit::<(), _>(Priority::Normal, || Ok(())),
            Err(StellwerkError::Cancelled)
        ));

        // A second terminate returns without doing anything.
        optimizer.terminate().await;
    }

    #[tokio::test]
    async fn cache_and_pool_use_configured_caps() {
        let mut config = two_unit_config();
        config.cache.max_entries = 2;
        config.pool.max_size = 1;
        let optimizer = Optimizer::new(config, EchoWorker).unwrap();

        let cache = optimizer.memo_cache("doubles", |n: &u32| n * 2);
        assert_eq!(cache.call(&1), 2);
        assert_eq!(cache.call(&2), 4);
        assert_eq!(cache.call(&3), 6);
        assert_eq!(cache.len(), 2);

        let pool = optimizer.resource_pool("buffers", Vec::<u8>::new, |buf| buf.clear());
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 1);

        optimizer.terminate().await;
    }
}
