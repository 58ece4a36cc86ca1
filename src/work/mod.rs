//! Asynchronous work substrate
//!
//! The scheduler is written against the small [`AsyncWork`] contract rather
//! than a concrete thread pool:
//! - `submit`: run a job as soon as a worker is free
//! - `schedule_after`: run a job once a delay has elapsed
//! - `schedule_on_signal`: run a job once a [`Signal`] is raised
//! - `cancel`: drop a job that has not started yet
//!
//! Jobs are plain closures; they must not block the worker on I/O. Waiting is
//! always expressed as "schedule a callback on a timer or signal".

mod context;
mod tokio_work;

pub use context::{FaultReport, FaultState, WorkContext};
pub use tokio_work::{CaptureRuntime, TokioWork};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A unit of scheduled work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Priority class of a work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkQueue {
    /// Processing, mixing and encoding
    Default,
    /// Clock callbacks and capture; served ahead of `Default`
    Capture,
}

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a scheduled job; cancelling it before the job starts drops the job.
#[derive(Debug, Clone)]
pub struct WorkToken {
    id: u64,
    cancel: CancellationToken,
}

impl WorkToken {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One-shot manual-reset event that jobs can be scheduled on
#[derive(Debug, Clone, Default)]
pub struct Signal {
    raised: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.is_cancelled()
    }

    pub async fn wait(&self) {
        self.raised.cancelled().await
    }
}

/// Work substrate contract
pub trait AsyncWork: Send + Sync {
    fn submit(&self, queue: WorkQueue, job: Job) -> WorkToken;

    fn schedule_after(&self, queue: WorkQueue, delay: Duration, job: Job) -> WorkToken;

    fn schedule_on_signal(&self, queue: WorkQueue, signal: &Signal, job: Job) -> WorkToken;

    /// Returns `false` when the token was already cancelled
    fn cancel(&self, token: &WorkToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        true
    }
}
