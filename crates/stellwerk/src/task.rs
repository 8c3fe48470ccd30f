//! Work items, priority classes, and completion handles.
//!
//! A [`WorkItem`] pairs a priority class with a type-erased job closure.
//! The caller's typed result travels through a [`Completion`] handle that
//! resolves exactly once, even when the item is cancelled before running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::StellwerkError;

/// Priority classes for scheduled work, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// All classes in drain order, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Lowercase name, used in metrics keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What running a job produced, for cycle accounting.
///
/// The caller's typed result has already been delivered through the
/// item's [`Completion`] by the time this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Type-erased job closure carried by a [`WorkItem`].
pub type Job = Box<dyn FnOnce() -> JobOutcome + Send + 'static>;

/// A unit of scheduled work: a priority class plus a job closure.
///
/// Dropping an unexecuted item drops the job, which resolves the
/// caller's [`Completion`] with `Cancelled`.
pub struct WorkItem {
    id: Uuid,
    priority: Priority,
    enqueued_at: Instant,
    job: Option<Job>,
}

impl WorkItem {
    /// Build an item around a fallible job, returning the item and the
    /// handle its result will arrive on.
    ///
    /// A panic inside `job` is contained to this item and surfaces as
    /// [`StellwerkError::JobFailed`] on the handle.
    pub fn new<T, F>(priority: Priority, job: F) -> (Self, Completion<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StellwerkError> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (tx, completion) = Completion::channel(id);

        let erased: Job = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(value)) => {
                    let _ = tx.send(Ok(value));
                    JobOutcome::Completed
                }
                Ok(Err(e)) => {
                    let reason = e.to_string();
                    let _ = tx.send(Err(e));
                    JobOutcome::Failed(reason)
                }
                Err(payload) => {
                    let reason = panic_message(payload);
                    let _ = tx.send(Err(StellwerkError::JobFailed(reason.clone())));
                    JobOutcome::Failed(reason)
                }
            }
        });

        (
            Self {
                id,
                priority,
                enqueued_at: Instant::now(),
                job: Some(erased),
            },
            completion,
        )
    }

    /// A blank item with no job attached, as produced by item recycling.
    ///
    /// Blank items are rejected by the scheduler at submit time.
    pub fn blank(priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            enqueued_at: Instant::now(),
            job: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// How long the item has been waiting since submission.
    pub fn queued_for(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }

    pub(crate) fn has_job(&self) -> bool {
        self.job.is_some()
    }

    pub(crate) fn take_job(&mut self) -> Option<Job> {
        self.job.take()
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("has_job", &self.job.is_some())
            .finish()
    }
}

/// One-shot handle to a submitted or offloaded piece of work.
///
/// Resolves exactly once. If the producing side disappears before
/// resolving (scheduler shutdown, dispatcher terminate), waiting returns
/// `Cancelled` rather than hanging.
pub struct Completion<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, StellwerkError>>,
}

impl<T> Completion<T> {
    /// Create a sender/handle pair for the given task id.
    pub(crate) fn channel(id: Uuid) -> (oneshot::Sender<Result<T, StellwerkError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    /// A handle that is already resolved, for rejections decided at call
    /// time (zero live units, post-terminate offloads).
    pub(crate) fn resolved(id: Uuid, result: Result<T, StellwerkError>) -> Self {
        let (tx, handle) = Self::channel(id);
        let _ = tx.send(result);
        handle
    }

    /// Id of the work this handle tracks.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the result.
    pub async fn wait(self) -> Result<T, StellwerkError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StellwerkError::Cancelled),
        }
    }

    /// Block on the result from a non-async context.
    ///
    /// Must not be called from inside an async runtime thread.
    pub fn wait_blocking(self) -> Result<T, StellwerkError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(StellwerkError::Cancelled),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
