//! Presentation clock
//!
//! One clock per topology. Sinks register a [`ClockSubscriber`] and receive
//! a [`ClockSink`]: a sorted set of pending due times of which only the
//! earliest holds a timer on the work substrate.

mod presentation;
mod sink;
mod tick;
mod time_source;

pub use presentation::{ClockState, PresentationClock};
pub use sink::{ClockSink, ClockSubscriber, SinkState};
pub use tick::TickScheduler;
pub use time_source::{ManualTimeSource, SystemTimeSource, TimeSource};

use std::sync::Arc;

use crate::work::{AsyncWork, WorkContext};

/// State shared between a clock and its sinks
pub(crate) struct ClockShared {
    pub(crate) time_source: Arc<dyn TimeSource>,
    pub(crate) work: Arc<dyn AsyncWork>,
    pub(crate) context: WorkContext,
}
