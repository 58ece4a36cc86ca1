use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::sink::{ClockSink, ClockSubscriber, SinkState};
use super::time_source::TimeSource;
use super::ClockShared;
use crate::error::{PipelineError, Result};
use crate::pipeline::stream::ComponentId;
use crate::pipeline::types::Timestamp;
use crate::work::{AsyncWork, WorkContext, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
    Paused,
}

struct ClockInner {
    state: ClockState,
    sinks: Vec<Arc<ClockSink>>,
}

/// Time-source-driven scheduler firing per-sink callbacks
///
/// Start, stop and pause are broadcast to every sink under one lock. Start is
/// all-or-nothing: if one subscriber refuses, the sinks already started are
/// stopped again and the clock stays stopped.
pub struct PresentationClock {
    shared: Arc<ClockShared>,
    inner: Mutex<ClockInner>,
}

impl PresentationClock {
    pub fn new(
        time_source: Arc<dyn TimeSource>,
        work: Arc<dyn AsyncWork>,
        context: WorkContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(ClockShared {
                time_source,
                work,
                context,
            }),
            inner: Mutex::new(ClockInner {
                state: ClockState::Stopped,
                sinks: Vec::new(),
            }),
        })
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.shared.time_source
    }

    pub fn work(&self) -> &Arc<dyn AsyncWork> {
        &self.shared.work
    }

    pub fn context(&self) -> &WorkContext {
        &self.shared.context
    }

    pub fn now(&self) -> Timestamp {
        self.shared.time_source.get_current_time()
    }

    pub fn state(&self) -> ClockState {
        self.inner.lock().state
    }

    pub fn sinks(&self) -> Vec<Arc<ClockSink>> {
        self.inner.lock().sinks.clone()
    }

    /// Register a subscriber; the sink starts with the next `clock_start`
    pub fn register_sink(
        &self,
        key: ComponentId,
        name: &str,
        subscriber: Weak<dyn ClockSubscriber>,
    ) -> Arc<ClockSink> {
        let sink = ClockSink::new(key, name, subscriber, Arc::clone(&self.shared));
        self.inner.lock().sinks.push(Arc::clone(&sink));
        debug!("Registered clock sink '{}' ({})", name, key);
        sink
    }

    pub fn unregister_sink(&self, sink: &Arc<ClockSink>) {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sink.take_pending(SinkState::Unregistered);
    }

    /// Start every idle sink at `t`.
    ///
    /// With `previous`, pending due times of the outgoing clock move to the
    /// sink registered under the same component key; outgoing sinks without a
    /// counterpart are asked to drain.
    pub fn clock_start(&self, t: Timestamp, previous: Option<&Arc<PresentationClock>>) -> Result<()> {
        let previous = previous.filter(|p| !std::ptr::eq(Arc::as_ptr(p), self));
        let outgoing = previous.map(|p| p.sinks()).unwrap_or_default();

        let mut inner = self.inner.lock();
        // a source shared with a running clock is left alone on rollback
        let owns_source = !self.shared.time_source.is_running();
        if owns_source {
            self.shared.time_source.set_current_time(t);
            self.shared.time_source.start();
        }

        let idle: Vec<Arc<ClockSink>> = inner
            .sinks
            .iter()
            .filter(|s| s.state() == SinkState::Idle)
            .cloned()
            .collect();
        let mut started: Vec<Arc<ClockSink>> = Vec::with_capacity(idle.len());
        for sink in idle {
            let inherited = outgoing
                .iter()
                .find(|old| old.key() == sink.key())
                .and_then(|old| old.next_due());

            sink.set_state(SinkState::Running);
            let accepted = match sink.subscriber().upgrade() {
                Some(subscriber) => subscriber.on_clock_start(t, inherited),
                None => Ok(()),
            };
            if let Err(e) = accepted {
                warn!("Clock sink '{}' refused to start: {}", sink.name(), e);
                sink.take_pending(SinkState::Idle);
                for other in started {
                    other.take_pending(SinkState::Idle);
                    if let Some(subscriber) = other.subscriber().upgrade() {
                        subscriber.on_clock_stop(t);
                    }
                }
                if owns_source {
                    self.shared.time_source.stop();
                }
                inner.state = ClockState::Stopped;
                return Err(PipelineError::ClockRefused(sink.name().to_string()));
            }
            started.push(sink);
        }

        let mut handed_off = 0;
        for old in &outgoing {
            let due_times: BTreeSet<i64> = old.take_pending(SinkState::Idle);
            match inner.sinks.iter().find(|s| s.key() == old.key()) {
                Some(sink) => {
                    old.hand_over_to(sink);
                    handed_off += due_times.len();
                    if !due_times.is_empty() {
                        sink.adopt(due_times);
                    }
                }
                None if due_times.is_empty() => {}
                None => {
                    debug!("Clock sink '{}' has no successor, draining", old.name());
                    let subscriber = old.subscriber();
                    self.shared.work.submit(
                        WorkQueue::Default,
                        Box::new(move || {
                            if let Some(subscriber) = subscriber.upgrade() {
                                subscriber.on_clock_stop(t);
                            }
                        }),
                    );
                }
            }
        }
        if let Some(previous) = previous {
            previous.retire();
        }

        inner.state = ClockState::Running;
        info!(
            "Clock started at {} ({} sinks, {} callbacks handed off)",
            t,
            started.len(),
            handed_off
        );
        Ok(())
    }

    /// Stop every sink at `t`; subscribers drain synchronously
    pub fn clock_stop(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        for sink in inner.sinks.iter() {
            sink.take_pending(SinkState::Idle);
        }
        for sink in inner.sinks.iter() {
            if let Some(subscriber) = sink.subscriber().upgrade() {
                subscriber.on_clock_stop(t);
            }
        }
        self.shared.time_source.stop();
        inner.state = ClockState::Stopped;
        info!("Clock stopped at {}", t);
    }

    /// Suspend callbacks; pending due times are dropped and sinks reschedule
    /// when the clock starts again
    pub fn clock_pause(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        for sink in inner.sinks.iter() {
            sink.take_pending(SinkState::Idle);
            if let Some(subscriber) = sink.subscriber().upgrade() {
                subscriber.on_clock_pause(t);
            }
        }
        self.shared.time_source.stop();
        inner.state = ClockState::Paused;
        info!("Clock paused at {}", t);
    }

    /// Outgoing clock after a handoff: no callbacks, time source untouched
    fn retire(&self) {
        let mut inner = self.inner.lock();
        for sink in inner.sinks.iter() {
            sink.take_pending(SinkState::Idle);
        }
        inner.state = ClockState::Stopped;
    }
}

impl std::fmt::Debug for PresentationClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PresentationClock")
            .field("state", &inner.state)
            .field("sinks", &inner.sinks.len())
            .finish()
    }
}
