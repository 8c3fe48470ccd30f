//! Worker units: dedicated OS threads running offloaded requests.
//!
//! Each unit blocks on its inbox, runs the shared [`UnitWorker`] for
//! every job, and reports outcomes on the dispatcher's reply channel. A
//! panic inside `process` kills only that unit; the crash is reported
//! before the thread exits.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::StellwerkError;
use crate::task::panic_message;

/// The computation a worker unit runs for each offloaded request.
///
/// One implementation is shared by every unit; `process` runs on a
/// unit's dedicated thread and may block.
pub trait UnitWorker: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Handle one request. An `Err` fails only this task; a panic
    /// takes the unit down with it.
    fn process(&self, request: Self::Request) -> Result<Self::Response, StellwerkError>;
}

/// One request on its way to a unit.
pub(crate) struct UnitJob<W: UnitWorker> {
    pub task_id: Uuid,
    pub request: W::Request,
}

/// What a unit sends back to the dispatcher's reply loop.
pub(crate) enum UnitReply<W: UnitWorker> {
    /// `process` returned; the task resolves with this outcome.
    Done {
        unit_id: usize,
        task_id: Uuid,
        outcome: Result<W::Response, StellwerkError>,
    },
    /// `process` panicked; the unit thread is gone.
    Crashed {
        unit_id: usize,
        task_id: Uuid,
        reason: String,
    },
}

/// Spawn one unit thread reading jobs from `inbox` until it closes.
pub(crate) fn spawn_unit<W: UnitWorker>(
    unit_id: usize,
    worker: Arc<W>,
    mut inbox: mpsc::Receiver<UnitJob<W>>,
    replies: mpsc::Sender<UnitReply<W>>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("stellwerk-unit-{unit_id}"))
        .spawn(move || {
            debug!(unit = unit_id, "unit thread started");
            while let Some(job) = inbox.blocking_recv() {
                let task_id = job.task_id;
                match catch_unwind(AssertUnwindSafe(|| worker.process(job.request))) {
                    Ok(outcome) => {
                        let reply = UnitReply::Done {
                            unit_id,
                            task_id,
                            outcome,
                        };
                        if replies.blocking_send(reply).is_err() {
                            // Dispatcher gone; nothing left to report to.
                            break;
                        }
                    }
                    Err(payload) => {
                        let reason = panic_message(payload);
                        error!(unit = unit_id, task = %task_id, %reason, "unit crashed while processing");
                        let _ = replies.blocking_send(UnitReply::Crashed {
                            unit_id,
                            task_id,
                            reason,
                        });
                        return;
                    }
                }
            }
            debug!(unit = unit_id, "unit thread exiting");
        })
        .expect("failed to spawn unit thread")
}
