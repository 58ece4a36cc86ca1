use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Fault raised by a stream or clock sink and forwarded to the supervisor
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Name of the stream or sink that raised the fault
    pub origin: String,
    pub error: PipelineError,
}

/// Shared fault state of one clock domain
#[derive(Debug, Default)]
pub struct FaultState {
    faulted: AtomicBool,
    reports: AtomicU64,
    first: Mutex<Option<PipelineError>>,
}

impl FaultState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault; the first one is kept for the final report
    pub fn raise(&self, error: &PipelineError) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        if !self.faulted.swap(true, Ordering::AcqRel) {
            *self.first.lock() = Some(error.clone());
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    pub fn first_error(&self) -> Option<PipelineError> {
        self.first.lock().clone()
    }
}

/// Context threaded through every scheduled job of one clock domain.
///
/// Replaces any process-global "pause callbacks" flag: scheduled work checks
/// `is_active()` before invoking a sink, and faults go to the one supervisor
/// through `report`.
#[derive(Debug, Clone)]
pub struct WorkContext {
    cancel: CancellationToken,
    faults: Arc<FaultState>,
    supervisor: Option<mpsc::UnboundedSender<FaultReport>>,
}

impl WorkContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            faults: Arc::new(FaultState::new()),
            supervisor: None,
        }
    }

    /// Context whose faults are forwarded to a supervisor channel
    pub fn supervised(
        cancel: CancellationToken,
        supervisor: mpsc::UnboundedSender<FaultReport>,
    ) -> Self {
        Self {
            cancel,
            faults: Arc::new(FaultState::new()),
            supervisor: Some(supervisor),
        }
    }

    /// A detached context for tests and standalone use
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn faults(&self) -> &Arc<FaultState> {
        &self.faults
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether scheduled work may still invoke sinks
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Record a fault and hand it to the supervisor
    pub fn report(&self, origin: &str, error: PipelineError) {
        self.faults.raise(&error);
        match &self.supervisor {
            Some(tx) => {
                let report = FaultReport {
                    origin: origin.to_string(),
                    error,
                };
                if tx.send(report).is_err() {
                    debug!("supervisor gone, fault from {} not forwarded", origin);
                }
            }
            None => warn!("Unsupervised fault in {}: {}", origin, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_state_keeps_first_error() {
        let ctx = WorkContext::detached();
        ctx.report("a", PipelineError::fatal("a", "first"));
        ctx.report("b", PipelineError::fatal("b", "second"));
        assert!(ctx.faults().is_faulted());
        assert_eq!(ctx.faults().reports(), 2);
        assert_eq!(
            ctx.faults().first_error(),
            Some(PipelineError::fatal("a", "first"))
        );
    }

    #[test]
    fn test_report_reaches_supervisor_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = WorkContext::supervised(CancellationToken::new(), tx);
        ctx.report("mixer", PipelineError::Overloaded("busy".into()));
        let report = rx.try_recv().expect("report forwarded");
        assert_eq!(report.origin, "mixer");
        assert!(ctx.is_active());
        ctx.cancel();
        assert!(!ctx.is_active());
    }
}
