use std::time::Duration;

use log::{trace, warn};

use super::sink::ClockSink;
use crate::error::{PipelineError, Result};
use crate::pipeline::types::{FrameRate, Timestamp};

/// Drift-free periodic schedule for a clock sink
///
/// Due times are derived from an integer tick index on a rational rate, so a
/// sink ticking at 30000/1001 for hours lands on the same instants as one
/// computed in a single step.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    rate: FrameRate,
    next_tick: i64,
    /// Lateness served at once instead of skipped
    slack: Duration,
    discontinuity: bool,
    started: bool,
}

impl TickScheduler {
    pub fn new(rate: FrameRate) -> Self {
        Self {
            rate,
            next_tick: 0,
            slack: Duration::ZERO,
            discontinuity: false,
            started: false,
        }
    }

    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    pub fn rate(&self) -> FrameRate {
        self.rate
    }

    /// Due time of the next tick
    pub fn next_due(&self) -> Timestamp {
        self.rate.time_of(self.next_tick)
    }

    /// Position on the first tick boundary at or after `t`.
    /// Restarting a schedule that already ran flags a discontinuity.
    pub fn start_at(&mut self, t: Timestamp) {
        let tick = self.rate.frame_at(t);
        self.next_tick = if self.rate.time_of(tick) < t {
            tick + 1
        } else {
            tick
        };
        if self.started {
            self.discontinuity = true;
        }
        self.started = true;
    }

    /// Continue from a due time inherited from a previous clock
    pub fn resume_at(&mut self, due: Timestamp) {
        self.next_tick = self.rate.frame_at(due);
        self.started = true;
    }

    /// The tick at `due` fired; the next one follows it
    pub fn advance_past(&mut self, due: Timestamp) {
        self.next_tick = self.rate.frame_at(due) + 1;
    }

    /// Schedule the next tick on `sink`.
    ///
    /// A tick late by no more than the slack keeps its boundary and fires at
    /// once. A later one is skipped: the schedule jumps to the first boundary
    /// after the current time and a discontinuity is flagged. Only errors
    /// other than lateness are returned.
    pub fn schedule(&mut self, sink: &ClockSink) -> Result<Timestamp> {
        loop {
            let due = self.next_due();
            match sink.schedule_new_callback(due) {
                Ok(()) => return Ok(due),
                Err(PipelineError::DueTimeElapsed { now, .. }) if now.diff(due) <= self.slack => {
                    trace!("Clock sink '{}' late by {:?}, within slack", sink.name(), now.diff(due));
                    sink.schedule_late_callback(due)?;
                    return Ok(due);
                }
                Err(PipelineError::DueTimeElapsed { now, .. }) => {
                    let resume = self.rate.frame_at(now) + 1;
                    warn!(
                        "Clock sink '{}' late by {:?}, skipping {} ticks",
                        sink.name(),
                        now.diff(due),
                        resume - self.next_tick
                    );
                    self.next_tick = resume;
                    self.discontinuity = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume the discontinuity flag
    pub fn take_discontinuity(&mut self) -> bool {
        std::mem::take(&mut self.discontinuity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeSource;

    #[test]
    fn test_start_on_boundary() {
        let rate = FrameRate::new(30, 1);
        let mut tick = TickScheduler::new(rate);
        tick.start_at(Timestamp::ZERO);
        assert_eq!(tick.next_due(), Timestamp::ZERO);
        tick.start_at(Timestamp::from_micros(1));
        assert_eq!(tick.next_due(), rate.time_of(1));
        assert!(tick.take_discontinuity());
        assert!(!tick.take_discontinuity());
    }

    #[test]
    fn test_advance_has_no_drift() {
        let rate = FrameRate::new(30000, 1001);
        let mut tick = TickScheduler::new(rate);
        tick.start_at(Timestamp::ZERO);
        for _ in 0..9_000 {
            let due = tick.next_due();
            tick.advance_past(due);
        }
        assert_eq!(tick.next_due(), rate.time_of(9_000));
    }

    #[test]
    fn test_late_tick_within_slack_keeps_boundary() {
        let time = std::sync::Arc::new(crate::clock::ManualTimeSource::new());
        let clock = crate::testing::clock_on(time.clone());
        let sink = clock.register_sink(
            crate::pipeline::stream::ComponentId::next(),
            "slack",
            std::sync::Weak::<Noop>::new(),
        );
        clock.clock_start(Timestamp::ZERO, None).unwrap();
        time.advance(Duration::from_millis(11));

        let mut tick = TickScheduler::new(FrameRate::per_second(100)).with_slack(Duration::from_millis(2));
        tick.resume_at(Timestamp::from_micros(10_000));
        assert_eq!(tick.schedule(&sink).unwrap(), Timestamp::from_micros(10_000));
        assert_eq!(sink.next_due(), Some(Timestamp::from_micros(10_000)));
        assert!(!tick.take_discontinuity());

        time.advance(Duration::from_millis(20));
        tick.advance_past(Timestamp::from_micros(10_000));
        assert_eq!(tick.schedule(&sink).unwrap(), Timestamp::from_micros(40_000));
        assert!(tick.take_discontinuity());
    }

    #[test]
    fn test_moving_clock_does_not_stop_ticks() {
        let time = std::sync::Arc::new(crate::testing::SteppingTimeSource::new(Duration::from_micros(1)));
        let clock = crate::testing::clock_on(time.clone());
        let sink = clock.register_sink(
            crate::pipeline::stream::ComponentId::next(),
            "moving",
            std::sync::Weak::<Noop>::new(),
        );
        clock.clock_start(Timestamp::ZERO, None).unwrap();
        time.set_current_time(Timestamp::from_micros(11_000));

        let mut tick = TickScheduler::new(FrameRate::per_second(100)).with_slack(Duration::from_millis(5));
        tick.resume_at(Timestamp::from_micros(10_000));
        for _ in 0..50 {
            let due = tick.schedule(&sink).unwrap();
            assert!(sink.cancel_callback(due));
        }
        assert!(!tick.take_discontinuity());
    }

    struct Noop;

    impl crate::clock::ClockSubscriber for Noop {
        fn on_clock_start(&self, _: Timestamp, _: Option<Timestamp>) -> Result<()> {
            Ok(())
        }

        fn on_clock_stop(&self, _: Timestamp) {}

        fn on_clock_callback(&self, _: Timestamp) {}
    }

    #[test]
    fn test_resume_at_inherited_due() {
        let rate = FrameRate::per_second(100);
        let mut tick = TickScheduler::new(rate);
        tick.resume_at(Timestamp::from_micros(250_000));
        assert_eq!(tick.next_due(), Timestamp::from_micros(250_000));
        assert!(!tick.take_discontinuity());
    }
}
