//! Fault supervisor for one clock domain
//!
//! Streams and clock sinks report faults through their [`WorkContext`]; the
//! supervisor is the single consumer of those reports and the only place
//! that decides to tear a topology down.

use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError};
use crate::work::{FaultReport, FaultState, WorkContext};

/// What to do about a reported fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Already handled locally
    Ignore,
    /// Cancel the work context; the owner stops the session
    Teardown,
}

pub fn decide(error: &PipelineError) -> Decision {
    match error.kind() {
        ErrorKind::TransientOverload | ErrorKind::NotConnected | ErrorKind::Cancelled => {
            Decision::Ignore
        }
        ErrorKind::ContractViolation | ErrorKind::Fatal | ErrorKind::ResourceExhaustion => {
            Decision::Teardown
        }
    }
}

pub struct Supervisor {
    reports: mpsc::UnboundedReceiver<FaultReport>,
    cancel: CancellationToken,
    faults: Arc<FaultState>,
}

impl Supervisor {
    /// Supervisor plus the context to hand to sessions and clocks
    pub fn new(cancel: CancellationToken) -> (Self, WorkContext) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = WorkContext::supervised(cancel.clone(), tx);
        (
            Self {
                reports: rx,
                cancel,
                faults: Arc::clone(context.faults()),
            },
            context,
        )
    }

    /// Consume reports until the context is cancelled or every reporter is
    /// gone. Returns the fault that caused a teardown, if any.
    pub async fn run(mut self) -> Option<FaultReport> {
        loop {
            let report = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Supervisor stopping: context cancelled");
                    return None;
                }
                report = self.reports.recv() => report,
            };
            let Some(report) = report else {
                debug!("Supervisor stopping: no reporters left");
                return None;
            };

            match decide(&report.error) {
                Decision::Ignore => {
                    debug!("Ignoring {} from {}: {}", report.error.kind(), report.origin, report.error)
                }
                Decision::Teardown => {
                    error!(
                        "Tearing down after {} in {}: {}",
                        report.error.kind(),
                        report.origin,
                        report.error
                    );
                    self.cancel.cancel();
                    info!("{} faults reported in total", self.faults.reports());
                    return Some(report);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stream::StreamId;

    #[test]
    fn test_decisions_per_kind() {
        assert_eq!(decide(&PipelineError::Overloaded("busy".into())), Decision::Ignore);
        assert_eq!(decide(&PipelineError::NotConnected(StreamId(1))), Decision::Ignore);
        assert_eq!(decide(&PipelineError::Cancelled), Decision::Ignore);
        assert_eq!(
            decide(&PipelineError::fatal("encoder", "codec lost")),
            Decision::Teardown
        );
        assert_eq!(
            decide(&PipelineError::MixerInputMissing { input: 0, packet: 1 }),
            Decision::Teardown
        );
    }

    #[tokio::test]
    async fn test_fatal_report_cancels_context() {
        let (supervisor, context) = Supervisor::new(CancellationToken::new());
        let task = tokio::spawn(supervisor.run());

        context.report("tone", PipelineError::Overloaded("late".into()));
        assert!(!context.is_cancelled());
        context.report("encoder", PipelineError::fatal("encoder", "device lost"));

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.origin, "encoder");
        assert!(context.is_cancelled());
        assert_eq!(context.faults().reports(), 2);
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let (supervisor, _context) = Supervisor::new(cancel.clone());
        cancel.cancel();
        assert!(supervisor.run().await.is_none());
    }
}
