//! Shared test fixtures

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::{ManualTimeSource, PresentationClock, TimeSource};
use crate::pipeline::types::Timestamp;
use crate::work::{AsyncWork, Job, Signal, WorkContext, WorkQueue, WorkToken};

/// Work substrate that accepts jobs and never runs them
pub(crate) struct NullWork;

impl AsyncWork for NullWork {
    fn submit(&self, _: WorkQueue, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_after(&self, _: WorkQueue, _: Duration, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_on_signal(&self, _: WorkQueue, _: &Signal, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }
}

/// Runs submitted jobs on the calling thread; timers never fire
pub(crate) struct InlineWork;

impl AsyncWork for InlineWork {
    fn submit(&self, _: WorkQueue, job: Job) -> WorkToken {
        job();
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_after(&self, _: WorkQueue, _: Duration, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_on_signal(&self, _: WorkQueue, _: &Signal, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }
}

/// Holds submitted jobs until `run_pending`
#[derive(Default)]
pub(crate) struct QueuedWork {
    jobs: Mutex<Vec<Job>>,
}

impl QueuedWork {
    pub(crate) fn run_pending(&self) -> usize {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        let count = jobs.len();
        for job in jobs {
            job();
        }
        count
    }
}

impl AsyncWork for QueuedWork {
    fn submit(&self, _: WorkQueue, job: Job) -> WorkToken {
        self.jobs.lock().push(job);
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_after(&self, _: WorkQueue, _: Duration, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }

    fn schedule_on_signal(&self, _: WorkQueue, _: &Signal, _: Job) -> WorkToken {
        WorkToken::new(CancellationToken::new())
    }
}

/// Clock on a manual time source whose callbacks never fire
pub(crate) fn test_clock() -> Arc<PresentationClock> {
    clock_on(Arc::new(ManualTimeSource::new()))
}

/// Clock whose timers only fire through `ClockSink::fire_now`
pub(crate) fn clock_on(time: Arc<dyn TimeSource>) -> Arc<PresentationClock> {
    PresentationClock::new(time, Arc::new(NullWork), WorkContext::detached())
}

/// Time source that moves forward by `step` on every read
pub(crate) struct SteppingTimeSource {
    micros: AtomicI64,
    step: i64,
    running: AtomicBool,
}

impl SteppingTimeSource {
    pub(crate) fn new(step: Duration) -> Self {
        Self {
            micros: AtomicI64::new(0),
            step: step.as_micros() as i64,
            running: AtomicBool::new(false),
        }
    }
}

impl TimeSource for SteppingTimeSource {
    fn get_current_time(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.fetch_add(self.step, Ordering::AcqRel))
    }

    fn set_current_time(&self, t: Timestamp) {
        self.micros.store(t.micros, Ordering::Release);
    }

    fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn to_clock_time(&self, _instant: Instant) -> Timestamp {
        self.get_current_time()
    }
}
