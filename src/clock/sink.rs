//! Per-subscriber callback queue of a presentation clock

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use super::ClockShared;
use crate::error::{PipelineError, Result};
use crate::pipeline::stream::ComponentId;
use crate::pipeline::types::Timestamp;
use crate::work::{WorkQueue, WorkToken};

/// Receiver of clock notifications
///
/// `on_clock_start` runs under the clock's broadcast lock and possibly under
/// the session's switch mutex; it may schedule callbacks but must not issue
/// requests. `on_clock_callback` runs outside every clock lock and is where
/// sinks pull and re-schedule themselves.
pub trait ClockSubscriber: Send + Sync {
    /// `inherited` is the earliest due time taken over from the previous
    /// clock; when set, the subscriber must not schedule a first tick itself.
    fn on_clock_start(&self, t: Timestamp, inherited: Option<Timestamp>) -> Result<()>;

    /// Flush everything buffered up to `t`
    fn on_clock_stop(&self, t: Timestamp);

    fn on_clock_pause(&self, _t: Timestamp) {}

    fn on_clock_callback(&self, due: Timestamp);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Unregistered,
    Idle,
    Running,
}

struct Armed {
    due: i64,
    token: WorkToken,
    generation: u64,
}

struct SinkInner {
    state: SinkState,
    pending: BTreeSet<i64>,
    armed: Option<Armed>,
    generation: u64,
    /// A callback is executing
    invoking: bool,
    /// The timer fired while a callback was executing
    deferred: bool,
    /// Sink of the next clock that took over after a handoff
    successor: Option<Weak<ClockSink>>,
}

/// Sorted set of pending due times with a single armed timer for the earliest
pub struct ClockSink {
    key: ComponentId,
    name: String,
    subscriber: Weak<dyn ClockSubscriber>,
    shared: Arc<ClockShared>,
    this: Weak<ClockSink>,
    inner: Mutex<SinkInner>,
}

impl ClockSink {
    pub(super) fn new(
        key: ComponentId,
        name: &str,
        subscriber: Weak<dyn ClockSubscriber>,
        shared: Arc<ClockShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| ClockSink {
            key,
            name: name.to_string(),
            subscriber,
            shared,
            this: this.clone(),
            inner: Mutex::new(SinkInner {
                state: SinkState::Idle,
                pending: BTreeSet::new(),
                armed: None,
                generation: 0,
                invoking: false,
                deferred: false,
                successor: None,
            }),
        })
    }

    /// Handoff key; sinks of the same component share it across clocks
    pub fn key(&self) -> ComponentId {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().state
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.inner
            .lock()
            .pending
            .first()
            .map(|&micros| Timestamp::from_micros(micros))
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn now(&self) -> Timestamp {
        self.shared.time_source.get_current_time()
    }

    /// Add `due` to the pending set.
    ///
    /// Fails with `DueTimeElapsed` when `due` is already in the past; the
    /// caller is expected to skip to its next tick and flag a discontinuity.
    pub fn schedule_new_callback(&self, due: Timestamp) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.lock();
        if inner.state != SinkState::Running {
            return Err(PipelineError::contract(format!(
                "clock sink '{}' scheduled while {:?}",
                self.name, inner.state
            )));
        }
        if due < now {
            return Err(PipelineError::DueTimeElapsed { due, now });
        }
        self.insert_locked(&mut inner, due);
        Ok(())
    }

    /// Add a due time that may already have passed; it fires at once.
    ///
    /// For ticks that are late by less than the caller's tolerance, so that a
    /// clock read racing the check cannot turn them into skips.
    pub fn schedule_late_callback(&self, due: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SinkState::Running {
            return Err(PipelineError::contract(format!(
                "clock sink '{}' scheduled while {:?}",
                self.name, inner.state
            )));
        }
        self.insert_locked(&mut inner, due);
        Ok(())
    }

    fn insert_locked(&self, inner: &mut SinkInner, due: Timestamp) {
        if !inner.pending.insert(due.micros) {
            return;
        }
        if inner.pending.first() == Some(&due.micros) {
            self.arm_locked(inner);
        }
    }

    /// Hand a due time this sink can no longer serve to the sink that took
    /// over from it at a clock handoff; returns whether one accepted it
    pub fn forward(&self, due: Timestamp) -> bool {
        let successor = self
            .inner
            .lock()
            .successor
            .as_ref()
            .and_then(Weak::upgrade);
        match successor {
            Some(next) => next.adopt(BTreeSet::from([due.micros])) || next.forward(due),
            None => false,
        }
    }

    /// Remove `due`; returns whether it was pending
    pub fn cancel_callback(&self, due: Timestamp) -> bool {
        let mut inner = self.inner.lock();
        if !inner.pending.remove(&due.micros) {
            return false;
        }
        if inner.armed.as_ref().map(|a| a.due) == Some(due.micros) {
            self.arm_locked(&mut inner);
        }
        true
    }

    /// (Re)arm the single timer for the earliest pending due time
    fn arm_locked(&self, inner: &mut SinkInner) {
        if let Some(armed) = inner.armed.take() {
            self.shared.work.cancel(&armed.token);
        }
        let Some(&due) = inner.pending.first() else {
            return;
        };
        inner.generation += 1;
        let generation = inner.generation;
        let delay = self
            .shared
            .time_source
            .delay_until(Timestamp::from_micros(due));
        let this = self.this.clone();
        let token = self.shared.work.schedule_after(
            WorkQueue::Capture,
            delay,
            Box::new(move || {
                if let Some(sink) = this.upgrade() {
                    sink.fire(generation);
                }
            }),
        );
        inner.armed = Some(Armed {
            due,
            token,
            generation,
        });
    }

    /// Timer completion: pop the earliest due time, re-arm, invoke.
    ///
    /// Invocations of one sink never overlap; a timer that fires during a
    /// callback is deferred and served as soon as the callback returns, so due
    /// times are delivered in order and at most once.
    fn fire(&self, generation: u64) {
        let mut due = {
            let mut inner = self.inner.lock();
            match &inner.armed {
                Some(armed) if armed.generation == generation => {}
                _ => return,
            }
            inner.armed = None;
            if inner.state != SinkState::Running || !self.shared.context.is_active() {
                return;
            }
            if inner.invoking {
                inner.deferred = true;
                return;
            }
            let Some(due) = inner.pending.pop_first() else {
                return;
            };
            inner.invoking = true;
            self.arm_locked(&mut inner);
            due
        };

        loop {
            match self.subscriber.upgrade() {
                Some(subscriber) => subscriber.on_clock_callback(Timestamp::from_micros(due)),
                None => trace!("clock sink '{}' lost its subscriber", self.name),
            }

            let mut inner = self.inner.lock();
            inner.invoking = false;
            if !inner.deferred {
                break;
            }
            inner.deferred = false;
            if inner.state != SinkState::Running || !self.shared.context.is_active() {
                break;
            }
            match inner.pending.pop_first() {
                Some(next) => {
                    inner.invoking = true;
                    self.arm_locked(&mut inner);
                    due = next;
                }
                None => break,
            }
        }
    }

    pub(super) fn set_state(&self, state: SinkState) {
        self.inner.lock().state = state;
    }

    pub(super) fn subscriber(&self) -> Weak<dyn ClockSubscriber> {
        self.subscriber.clone()
    }

    /// Disarm and empty the pending set, leaving the sink in `state`
    pub(super) fn take_pending(&self, state: SinkState) -> BTreeSet<i64> {
        let mut inner = self.inner.lock();
        if let Some(armed) = inner.armed.take() {
            self.shared.work.cancel(&armed.token);
        }
        inner.deferred = false;
        inner.state = state;
        std::mem::take(&mut inner.pending)
    }

    /// Fire the armed timer immediately, as the work substrate would
    #[cfg(test)]
    pub(crate) fn fire_now(&self) -> Option<Timestamp> {
        let (due, generation) = {
            let inner = self.inner.lock();
            let armed = inner.armed.as_ref()?;
            (armed.due, armed.generation)
        };
        self.fire(generation);
        Some(Timestamp::from_micros(due))
    }

    /// Take over due times handed off from a previous clock
    pub(super) fn adopt(&self, due_times: BTreeSet<i64>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SinkState::Running {
            return false;
        }
        let before = inner.pending.first().copied();
        inner.pending.extend(due_times);
        if inner.pending.first().copied() != before || inner.armed.is_none() {
            self.arm_locked(&mut inner);
        }
        true
    }

    pub(super) fn hand_over_to(&self, successor: &Arc<ClockSink>) {
        self.inner.lock().successor = Some(Arc::downgrade(successor));
    }
}

impl std::fmt::Debug for ClockSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClockSink")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .finish()
    }
}
