//! Worker unit dispatch with correlation-id reply matching.
//!
//! [`Dispatcher`] hands offloaded requests to a fixed set of worker
//! units (see [`crate::unit`]) and matches their replies back to the
//! caller's [`Completion`] by task id. Tasks that find every unit busy
//! wait in a dispatch queue; a unit finishing a task immediately takes
//! the oldest queued one, so no unit idles while work waits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StellwerkError;
use crate::metrics::{keys, MetricsCollector};
use crate::task::Completion;
use crate::unit::{spawn_unit, UnitJob, UnitReply, UnitWorker};

const REPLY_CHANNEL_CAPACITY: usize = 256;

/// An offloaded task awaiting its reply.
struct PendingDispatch<R> {
    reply: oneshot::Sender<Result<R, StellwerkError>>,
    started_at: Instant,
}

/// One unit's slot: inbox, assignment, and liveness.
struct UnitSlot<W: UnitWorker> {
    inbox: Option<mpsc::Sender<UnitJob<W>>>,
    busy: Option<Uuid>,
    alive: bool,
    _join: Option<std::thread::JoinHandle<()>>,
}

impl<W: UnitWorker> UnitSlot<W> {
    fn spawn(unit_id: usize, worker: Arc<W>, replies: mpsc::Sender<UnitReply<W>>) -> Self {
        // Capacity 1: a unit only ever has its single assigned job in
        // flight, so the inbox never fills.
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let join = spawn_unit(unit_id, worker, inbox_rx, replies);
        Self {
            inbox: Some(inbox_tx),
            busy: None,
            alive: true,
            _join: Some(join),
        }
    }

    /// Hand a job to this unit if it is idle and alive, giving the job
    /// back otherwise. A closed inbox means the thread died without a
    /// crash report; the slot is marked dead on the spot.
    fn try_assign(&mut self, job: UnitJob<W>) -> Result<(), UnitJob<W>> {
        if !self.alive || self.busy.is_some() {
            return Err(job);
        }
        let Some(inbox) = &self.inbox else {
            return Err(job);
        };
        let task_id = job.task_id;
        match inbox.try_send(job) {
            Ok(()) => {
                self.busy = Some(task_id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => Err(job),
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.alive = false;
                self.inbox = None;
                Err(job)
            }
        }
    }
}

/// State shared between the public API and the reply loop.
struct DispatchState<W: UnitWorker> {
    pending: Mutex<HashMap<Uuid, PendingDispatch<W::Response>>>,
    wait_queue: Mutex<VecDeque<UnitJob<W>>>,
    units: Mutex<Vec<UnitSlot<W>>>,
    terminated: AtomicBool,
    initialized: AtomicBool,
    metrics: MetricsCollector,
}

impl<W: UnitWorker> DispatchState<W> {
    /// Assign to an idle unit, or queue when all are busy.
    fn assign_or_queue(&self, job: UnitJob<W>) {
        if self.terminated.load(Ordering::SeqCst) {
            // The pending entry was already cancelled; drop the request.
            return;
        }

        let task_id = job.task_id;
        let mut unassigned = Some(job);
        {
            let mut units = self.units.lock().expect("units lock poisoned");
            for slot in units.iter_mut() {
                let Some(job) = unassigned.take() else { break };
                if let Err(returned) = slot.try_assign(job) {
                    unassigned = Some(returned);
                }
            }
        }

        if let Some(job) = unassigned {
            let depth = {
                let mut queue = self.wait_queue.lock().expect("wait queue lock poisoned");
                queue.push_back(job);
                queue.len()
            };
            debug!(task = %task_id, depth, "all units busy, task queued");
        } else {
            debug!(task = %task_id, "task assigned");
        }
        self.publish_gauges();
    }

    /// Deliver an outcome to the caller, exactly once per task id.
    fn resolve(&self, task_id: Uuid, outcome: Result<W::Response, StellwerkError>) {
        let entry = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&task_id);
        match entry {
            Some(pending) => {
                self.metrics
                    .record_duration(keys::DISPATCH_ROUNDTRIP, pending.started_at.elapsed());
                match &outcome {
                    Ok(_) => self.metrics.increment(keys::DISPATCH_COMPLETED, 1),
                    Err(_) => self.metrics.increment(keys::DISPATCH_FAILED, 1),
                }
                let _ = pending.reply.send(outcome);
            }
            // Late reply after terminate already cancelled the task.
            None => debug!(task = %task_id, "reply for unknown task id"),
        }
    }

    /// Mark a unit idle after a reply and keep it fed from the queue.
    fn finish_unit(&self, unit_id: usize, task_id: Uuid) {
        {
            let mut units = self.units.lock().expect("units lock poisoned");
            let Some(slot) = units.get_mut(unit_id) else {
                warn!(unit = unit_id, "reply from unknown unit slot");
                return;
            };
            if slot.alive && slot.busy != Some(task_id) {
                warn!(unit = unit_id, task = %task_id, "reply does not match the assigned task");
            }
            slot.busy = None;

            if slot.alive {
                let queued = self
                    .wait_queue
                    .lock()
                    .expect("wait queue lock poisoned")
                    .pop_front();
                if let Some(job) = queued {
                    if let Err(returned) = slot.try_assign(job) {
                        self.wait_queue
                            .lock()
                            .expect("wait queue lock poisoned")
                            .push_front(returned);
                    }
                }
            }
        }
        self.publish_gauges();
    }

    /// Take a crashed unit out of rotation.
    ///
    /// Only the task assigned to the unit fails; queued tasks stay
    /// queued for the survivors. No automatic respawn.
    fn mark_crashed(&self, unit_id: usize) {
        let live = {
            let mut units = self.units.lock().expect("units lock poisoned");
            if let Some(slot) = units.get_mut(unit_id) {
                slot.alive = false;
                slot.inbox = None;
                slot.busy = None;
                slot._join = None;
            }
            units.iter().filter(|slot| slot.alive).count()
        };

        let queued = self
            .wait_queue
            .lock()
            .expect("wait queue lock poisoned")
            .len();
        if live == 0 && queued > 0 {
            warn!(
                queued,
                "no live units remain; queued tasks stall until restart_unit or terminate"
            );
        }
        self.publish_gauges();
    }

    fn live_units(&self) -> usize {
        self.units
            .lock()
            .expect("units lock poisoned")
            .iter()
            .filter(|slot| slot.alive)
            .count()
    }

    fn publish_gauges(&self) {
        let (live, busy) = {
            let units = self.units.lock().expect("units lock poisoned");
            (
                units.iter().filter(|slot| slot.alive).count(),
                units.iter().filter(|slot| slot.busy.is_some()).count(),
            )
        };
        let queued = self
            .wait_queue
            .lock()
            .expect("wait queue lock poisoned")
            .len();
        self.metrics.set_gauge(keys::DISPATCH_LIVE_UNITS, live as f64);
        self.metrics.set_gauge(keys::DISPATCH_BUSY_UNITS, busy as f64);
        self.metrics.set_gauge(keys::DISPATCH_QUEUED, queued as f64);
    }
}

/// Route unit replies back to callers until every reply sender is gone.
async fn reply_loop<W: UnitWorker>(
    state: Arc<DispatchState<W>>,
    mut replies: mpsc::Receiver<UnitReply<W>>,
) {
    while let Some(reply) = replies.recv().await {
        match reply {
            UnitReply::Done {
                unit_id,
                task_id,
                outcome,
            } => {
                state.resolve(task_id, outcome);
                state.finish_unit(unit_id, task_id);
            }
            UnitReply::Crashed {
                unit_id,
                task_id,
                reason,
            } => {
                state.resolve(
                    task_id,
                    Err(StellwerkError::WorkerFailure {
                        unit: unit_id,
                        reason,
                    }),
                );
                state.mark_crashed(unit_id);
            }
        }
    }
    debug!("dispatch reply loop ended");
}

/// Dispatches offloaded requests across a fixed set of worker units.
///
/// Construction is cheap and spawns nothing; [`Dispatcher::initialize`]
/// brings the units and the reply loop up.
pub struct Dispatcher<W: UnitWorker> {
    worker: Arc<W>,
    worker_count: usize,
    state: Arc<DispatchState<W>>,
    /// Master reply sender, cloned into each unit. Dropped at terminate
    /// so the reply loop drains out and exits.
    reply_tx: Mutex<Option<mpsc::Sender<UnitReply<W>>>>,
    _loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<W: UnitWorker> Dispatcher<W> {
    /// Create a dispatcher that will run `worker_count` units of
    /// `worker` once initialized.
    pub fn new(worker: Arc<W>, worker_count: usize, metrics: MetricsCollector) -> Self {
        Self {
            worker,
            worker_count,
            state: Arc::new(DispatchState {
                pending: Mutex::new(HashMap::new()),
                wait_queue: Mutex::new(VecDeque::new()),
                units: Mutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                metrics,
            }),
            reply_tx: Mutex::new(None),
            _loop_handle: Mutex::new(None),
        }
    }

    /// Spawn the unit threads and the reply loop.
    ///
    /// Idempotent: a repeated call logs and returns without spawning
    /// anything further. Must be called inside a Tokio runtime.
    pub fn initialize(&self) -> Result<(), StellwerkError> {
        if self.state.terminated.load(Ordering::SeqCst) {
            return Err(StellwerkError::Cancelled);
        }
        if self.state.initialized.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already initialized, ignoring");
            return Ok(());
        }

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        {
            let mut units = self.state.units.lock().expect("units lock poisoned");
            for unit_id in 0..self.worker_count {
                units.push(UnitSlot::spawn(
                    unit_id,
                    Arc::clone(&self.worker),
                    reply_tx.clone(),
                ));
            }
        }
        *self.reply_tx.lock().expect("reply sender lock poisoned") = Some(reply_tx);

        let loop_state = Arc::clone(&self.state);
        let handle = tokio::spawn(reply_loop(loop_state, reply_rx));
        *self._loop_handle.lock().expect("loop handle lock poisoned") = Some(handle);

        self.state.publish_gauges();
        info!(units = self.worker_count, "dispatcher initialized");
        Ok(())
    }

    /// Offload a request to the units. Never blocks.
    ///
    /// The handle resolves exactly once: with the unit's response, with
    /// `WorkerUnavailable` when no live unit exists, with
    /// `WorkerFailure` when the executing unit crashes, or with
    /// `Cancelled` at terminate.
    pub fn offload(&self, request: W::Request) -> Completion<W::Response> {
        let task_id = Uuid::new_v4();

        if self.state.terminated.load(Ordering::SeqCst) {
            self.state.metrics.increment(keys::DISPATCH_REJECTED, 1);
            debug!(task = %task_id, "offload after terminate rejected");
            return Completion::resolved(task_id, Err(StellwerkError::Cancelled));
        }
        if self.state.live_units() == 0 {
            self.state.metrics.increment(keys::DISPATCH_REJECTED, 1);
            debug!(task = %task_id, "offload with no live units rejected");
            return Completion::resolved(task_id, Err(StellwerkError::WorkerUnavailable));
        }

        let (reply, completion) = Completion::channel(task_id);
        {
            let mut pending = self.state.pending.lock().expect("pending lock poisoned");
            // Re-checked under the lock: terminate sweeps this map, so
            // the entry must not slip in after the sweep.
            if self.state.terminated.load(Ordering::SeqCst) {
                drop(pending);
                self.state.metrics.increment(keys::DISPATCH_REJECTED, 1);
                let _ = reply.send(Err(StellwerkError::Cancelled));
                return completion;
            }
            pending.insert(
                task_id,
                PendingDispatch {
                    reply,
                    started_at: Instant::now(),
                },
            );
        }

        self.state.metrics.increment(keys::DISPATCH_OFFLOADED, 1);
        self.state.assign_or_queue(UnitJob { task_id, request });
        completion
    }

    /// Respawn a dead unit slot. Restart policy belongs to the caller;
    /// nothing respawns automatically.
    ///
    /// Restarting a live unit is a logged no-op. The restarted unit
    /// immediately picks up queued work.
    pub fn restart_unit(&self, unit_id: usize) -> Result<(), StellwerkError> {
        if self.state.terminated.load(Ordering::SeqCst) {
            return Err(StellwerkError::Cancelled);
        }
        let reply_tx = self
            .reply_tx
            .lock()
            .expect("reply sender lock poisoned")
            .clone();
        let Some(reply_tx) = reply_tx else {
            return Err(StellwerkError::UnknownUnit(unit_id));
        };

        {
            let mut units = self.state.units.lock().expect("units lock poisoned");
            let Some(slot) = units.get_mut(unit_id) else {
                return Err(StellwerkError::UnknownUnit(unit_id));
            };
            if slot.alive {
                warn!(unit = unit_id, "restart requested for a live unit, ignoring");
                return Ok(());
            }

            *slot = UnitSlot::spawn(unit_id, Arc::clone(&self.worker), reply_tx);
            info!(unit = unit_id, "unit restarted");

            let queued = self
                .state
                .wait_queue
                .lock()
                .expect("wait queue lock poisoned")
                .pop_front();
            if let Some(job) = queued {
                if let Err(returned) = slot.try_assign(job) {
                    self.state
                        .wait_queue
                        .lock()
                        .expect("wait queue lock poisoned")
                        .push_front(returned);
                }
            }
        }
        self.state.publish_gauges();
        Ok(())
    }

    /// Cancel everything and release the units.
    ///
    /// Every queued and in-flight task resolves `Cancelled`; unit
    /// threads exit after their current job; late replies are dropped.
    /// Further offloads resolve `Cancelled`. Idempotent.
    pub fn terminate(&self) {
        if self.state.terminated.swap(true, Ordering::SeqCst) {
            debug!("dispatcher already terminated");
            return;
        }

        let queued: Vec<UnitJob<W>> = {
            let mut queue = self
                .state
                .wait_queue
                .lock()
                .expect("wait queue lock poisoned");
            queue.drain(..).collect()
        };
        drop(queued);

        let entries: Vec<PendingDispatch<W::Response>> = {
            let mut pending = self.state.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        let cancelled = entries.len();
        for entry in entries {
            let _ = entry.reply.send(Err(StellwerkError::Cancelled));
        }
        if cancelled > 0 {
            self.state
                .metrics
                .increment(keys::DISPATCH_CANCELLED, cancelled as u64);
        }

        {
            let mut units = self.state.units.lock().expect("units lock poisoned");
            for slot in units.iter_mut() {
                slot.inbox = None;
                slot.alive = false;
                slot.busy = None;
            }
        }
        *self.reply_tx.lock().expect("reply sender lock poisoned") = None;

        self.state.publish_gauges();
        info!(cancelled, "dispatcher terminated");
    }

    /// Units currently alive.
    pub fn live_units(&self) -> usize {
        self.state.live_units()
    }

    /// Tasks waiting for an idle unit.
    pub fn queued_len(&self) -> usize {
        self.state
            .wait_queue
            .lock()
            .expect("wait queue lock poisoned")
            .len()
    }
}
