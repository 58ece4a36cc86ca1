//! Tokio binding of the work substrate

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

use super::{AsyncWork, Job, Signal, WorkQueue, WorkToken};

/// Runs jobs as tokio tasks.
///
/// Each queue is bound to a runtime handle; giving the capture queue its own
/// runtime keeps clock callbacks from queueing behind mixing work. Every token
/// is a child of `root`, so cancelling the root drops all pending work.
#[derive(Clone)]
pub struct TokioWork {
    default: Handle,
    capture: Handle,
    root: CancellationToken,
}

impl TokioWork {
    pub fn new(default: Handle, capture: Handle, root: CancellationToken) -> Self {
        Self {
            default,
            capture,
            root,
        }
    }

    /// Both queues on the runtime of the calling task
    ///
    /// Clock callbacks then share workers with mixing and encoding jobs; use
    /// [`TokioWork::with_capture`] where their latency matters. Panics when
    /// called outside a tokio runtime.
    pub fn current(root: CancellationToken) -> Arc<Self> {
        let handle = Handle::current();
        Arc::new(Self::new(handle.clone(), handle, root))
    }

    /// Default queue on the calling task's runtime, capture queue on
    /// `capture`, which the caller keeps alive
    pub fn with_capture(capture: &CaptureRuntime, root: CancellationToken) -> Arc<Self> {
        Arc::new(Self::new(Handle::current(), capture.handle().clone(), root))
    }

    fn handle(&self, queue: WorkQueue) -> &Handle {
        match queue {
            WorkQueue::Default => &self.default,
            WorkQueue::Capture => &self.capture,
        }
    }

    fn token(&self) -> WorkToken {
        WorkToken::new(self.root.child_token())
    }
}

/// Runtime reserved for the capture queue.
///
/// Shuts down in the background when dropped, so it may go out of scope
/// inside async code.
pub struct CaptureRuntime {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl CaptureRuntime {
    pub fn new(threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("castify-capture")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for CaptureRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl AsyncWork for TokioWork {
    fn submit(&self, queue: WorkQueue, job: Job) -> WorkToken {
        let token = self.token();
        let cancel = token.cancellation().clone();
        let id = token.id();
        self.handle(queue).spawn(async move {
            if cancel.is_cancelled() {
                trace!("work {} cancelled before start", id);
                return;
            }
            job();
        });
        token
    }

    fn schedule_after(&self, queue: WorkQueue, delay: Duration, job: Job) -> WorkToken {
        let token = self.token();
        let cancel = token.cancellation().clone();
        let id = token.id();
        self.handle(queue).spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => trace!("timer {} cancelled", id),
                _ = tokio::time::sleep(delay) => {
                    if !cancel.is_cancelled() {
                        job();
                    }
                }
            }
        });
        token
    }

    fn schedule_on_signal(&self, queue: WorkQueue, signal: &Signal, job: Job) -> WorkToken {
        let token = self.token();
        let cancel = token.cancellation().clone();
        let signal = signal.clone();
        let id = token.id();
        self.handle(queue).spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => trace!("signal wait {} cancelled", id),
                _ = signal.wait() => {
                    if !cancel.is_cancelled() {
                        job();
                    }
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_runs_job() {
        let work = TokioWork::current(CancellationToken::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        work.submit(
            WorkQueue::Default,
            Box::new(move || {
                let _ = tx.send(7);
            }),
        );
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_timer_never_fires() {
        let work = TokioWork::current(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let token = work.schedule_after(
            WorkQueue::Capture,
            Duration::from_millis(30),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(work.cancel(&token));
        assert!(!work.cancel(&token));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_signal_releases_job() {
        let work = TokioWork::current(CancellationToken::new());
        let signal = Signal::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        work.schedule_on_signal(
            WorkQueue::Default,
            &signal,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_raised());
        signal.raise();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("job ran after signal")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_root_cancel_drops_pending_work() {
        let root = CancellationToken::new();
        let work = TokioWork::current(root.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&fired);
            work.schedule_after(
                WorkQueue::Default,
                Duration::from_millis(20),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        root.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_queue_on_its_own_runtime() {
        let capture = CaptureRuntime::new(1).unwrap();
        let work = TokioWork::with_capture(&capture, CancellationToken::new());
        let thread_of = |queue: WorkQueue| {
            let (tx, rx) = tokio::sync::oneshot::channel();
            work.submit(
                queue,
                Box::new(move || {
                    let _ = tx.send(std::thread::current().name().map(str::to_string));
                }),
            );
            rx
        };

        let on_capture = thread_of(WorkQueue::Capture).await.unwrap();
        let on_default = thread_of(WorkQueue::Default).await.unwrap();
        assert_eq!(on_capture.as_deref(), Some("castify-capture"));
        assert_ne!(on_default.as_deref(), Some("castify-capture"));
    }
}
