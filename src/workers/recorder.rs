//! Clock-driven recording sink
//!
//! A recorder ticks on its topology's presentation clock and pulls one packet
//! per tick. It never queues: a tick that finds the previous packet still
//! outstanding is skipped and the next packet carries a discontinuity. On
//! clock stop it issues a final drain packet.
//!
//! The component is shareable; every topology gets a fresh sink registered
//! under the component's id, so a live switch hands the pending tick over to
//! the new sink and the shared [`RecorderStats`] see one continuous run.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::clock::{ClockSink, ClockSubscriber, PresentationClock, TickScheduler};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::stream::{Component, ComponentId, InstanceType, Stream, StreamId};
use crate::pipeline::types::{FrameRate, Payload, Sample, Timestamp};

/// Counters shared by every sink of one recorder component
#[derive(Debug, Default)]
pub struct RecorderStats {
    packets: AtomicU64,
    samples: AtomicU64,
    empty: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
    discontinuities: AtomicU64,
    skipped_ticks: AtomicU64,
    drains: AtomicU64,
    last_packet: Mutex<Option<u64>>,
}

impl RecorderStats {
    /// Account one reply; packet numbers must strictly increase
    fn record(&self, rp: &RequestPacket, sample: Option<&Sample>) -> Result<()> {
        {
            let mut last = self.last_packet.lock();
            if let Some(previous) = *last {
                if rp.packet_number <= previous {
                    return Err(PipelineError::contract(format!(
                        "recorder received packet {} after {}",
                        rp.packet_number, previous
                    )));
                }
            }
            *last = Some(rp.packet_number);
        }
        self.packets.fetch_add(1, Ordering::Relaxed);

        let Some(sample) = sample.filter(|s| s.duration > 0) else {
            self.empty.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.frames.fetch_add(sample.duration as u64, Ordering::Relaxed);
        if sample.discontinuity {
            self.discontinuities.fetch_add(1, Ordering::Relaxed);
        }
        if let Payload::Bytes(bytes) = &sample.payload {
            self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities.load(Ordering::Relaxed)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    pub fn drains(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    pub fn last_packet(&self) -> Option<u64> {
        *self.last_packet.lock()
    }
}

impl fmt::Display for RecorderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets ({} empty), {} frames, {} bytes, {} discontinuities, {} skipped ticks",
            self.packets(),
            self.empty.load(Ordering::Relaxed),
            self.frames(),
            self.bytes(),
            self.discontinuities(),
            self.skipped_ticks()
        )
    }
}

pub struct RecorderComponent {
    id: ComponentId,
    name: String,
    rate: FrameRate,
    slack: Duration,
    stats: Arc<RecorderStats>,
}

impl RecorderComponent {
    pub fn new(name: &str, rate: FrameRate) -> Self {
        Self {
            id: ComponentId::next(),
            name: name.to_string(),
            rate,
            slack: Duration::ZERO,
            stats: Arc::new(RecorderStats::default()),
        }
    }

    /// Lateness a tick may have and still be served
    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    pub fn stats(&self) -> &Arc<RecorderStats> {
        &self.stats
    }

    /// Create a sink registered with `clock`
    pub fn create_recorder(&self, clock: &Arc<PresentationClock>) -> Arc<RecorderSink> {
        Arc::new_cyclic(|this: &Weak<RecorderSink>| {
            let subscriber: Weak<dyn ClockSubscriber> = this.clone();
            RecorderSink {
                id: StreamId::next(),
                component: self.id,
                name: self.name.clone(),
                clock_sink: clock.register_sink(self.id, &self.name, subscriber),
                session: Mutex::new(Weak::new()),
                tick: Mutex::new(TickScheduler::new(self.rate).with_slack(self.slack)),
                in_flight: AtomicBool::new(false),
                missed: AtomicBool::new(false),
                pulled: AtomicBool::new(false),
                stats: Arc::clone(&self.stats),
            }
        })
    }
}

impl Component for RecorderComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::Shareable
    }

    fn create_stream(&self, clock: Option<&Arc<PresentationClock>>) -> Result<Arc<dyn Stream>> {
        let Some(clock) = clock else {
            return Err(PipelineError::contract(format!(
                "recorder '{}' needs a clock",
                self.name
            )));
        };
        Ok(self.create_recorder(clock))
    }
}

pub struct RecorderSink {
    id: StreamId,
    component: ComponentId,
    name: String,
    clock_sink: Arc<ClockSink>,
    session: Mutex<Weak<Session>>,
    tick: Mutex<TickScheduler>,
    /// A packet is outstanding
    in_flight: AtomicBool,
    /// A tick was skipped since the last packet
    missed: AtomicBool,
    /// At least one packet was issued; nothing to drain otherwise
    pulled: AtomicBool,
    stats: Arc<RecorderStats>,
}

impl RecorderSink {
    pub fn clock_sink(&self) -> &Arc<ClockSink> {
        &self.clock_sink
    }

    pub fn stats(&self) -> &Arc<RecorderStats> {
        &self.stats
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().upgrade()
    }

    fn pull(&self, session: &Session, mut rp: RequestPacket) -> Result<()> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::Overloaded(format!(
                "{} still waits for its previous packet",
                self.name
            )));
        }
        self.pulled.store(true, Ordering::Release);
        let result = session.request_sample(self.id, &mut rp, true);
        if result.is_err() {
            self.in_flight.store(false, Ordering::Release);
        }
        result
    }
}

impl ClockSubscriber for RecorderSink {
    fn on_clock_start(&self, t: Timestamp, inherited: Option<Timestamp>) -> Result<()> {
        let mut tick = self.tick.lock();
        match inherited {
            // the pending tick itself arrives through the handoff
            Some(due) => tick.resume_at(due),
            None => {
                tick.start_at(t);
                tick.schedule(&self.clock_sink)?;
            }
        }
        debug!("{} ticking at {} from {}", self.name, tick.rate(), tick.next_due());
        Ok(())
    }

    fn on_clock_stop(&self, t: Timestamp) {
        if !self.pulled.load(Ordering::Acquire) {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        let rp = RequestPacket::drain(t)
            .with_last_packet(true)
            .with_discontinuity(self.missed.swap(false, Ordering::AcqRel));
        match self.pull(&session, rp) {
            Ok(()) => {
                self.stats.drains.fetch_add(1, Ordering::Relaxed);
                info!("{} drained at {}: {}", self.name, t, self.stats);
            }
            Err(e) => debug!("{} could not drain at {}: {}", self.name, t, e),
        }
    }

    fn on_clock_callback(&self, due: Timestamp) {
        let Some(session) = self.session() else {
            return;
        };
        let discontinuity = {
            let mut tick = self.tick.lock();
            tick.advance_past(due);
            // lateness never surfaces here; what does is a retired clock sink
            if let Err(e) = tick.schedule(&self.clock_sink) {
                match e.kind() {
                    ErrorKind::ContractViolation => debug!("{} stops ticking: {}", self.name, e),
                    _ => warn!("{} could not schedule tick {}: {}", self.name, tick.next_due(), e),
                }
            }
            tick.take_discontinuity()
        };
        let discontinuity = self.missed.swap(false, Ordering::AcqRel) || discontinuity;

        let rp = RequestPacket::new(due).with_discontinuity(discontinuity);
        if let Err(e) = self.pull(&session, rp) {
            match e.kind() {
                ErrorKind::TransientOverload => {
                    self.missed.store(true, Ordering::Release);
                    self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                    session.health().record_drop();
                    debug!("{} skipped tick {}: {}", self.name, due, e);
                }
                // a switch took this sink out before the tick was numbered
                ErrorKind::NotConnected if self.clock_sink.forward(due) => {
                    debug!("{} handed tick {} to its successor", self.name, due)
                }
                ErrorKind::NotConnected => trace!("{} left the topology at {}", self.name, due),
                _ => debug!("{} tick {} failed: {}", self.name, due, e),
            }
        }
    }
}

impl Stream for RecorderSink {
    fn id(&self) -> StreamId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn component(&self) -> Option<ComponentId> {
        Some(self.component)
    }

    fn attach(&self, session: &Arc<Session>) {
        *self.session.lock() = Arc::downgrade(session);
    }

    fn request_sample(
        &self,
        _session: &Session,
        _rp: &RequestPacket,
        _prev: Option<StreamId>,
    ) -> Result<()> {
        Err(PipelineError::contract(format!(
            "{} is a sink and cannot be pulled",
            self.name
        )))
    }

    fn process_sample(
        &self,
        _session: &Session,
        sample: Option<Sample>,
        rp: &RequestPacket,
        _prev: StreamId,
    ) -> Result<()> {
        self.in_flight.store(false, Ordering::Release);
        self.stats.record(rp, sample.as_ref())?;
        trace!(
            "{} got packet {}: {:?}",
            self.name,
            rp.packet_number,
            sample.as_ref().and_then(Sample::frame_range)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, TimeSource};
    use crate::pipeline::topology::TopologyBuilder;
    use crate::pipeline::types::MediaKind;
    use crate::testing::clock_on;
    use crate::work::WorkContext;

    /// Source answering every request with one frame, or never
    struct Source {
        id: StreamId,
        answer: bool,
        seen: Mutex<Vec<(u64, bool)>>,
    }

    impl Source {
        fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                id: StreamId::next(),
                answer,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Stream for Source {
        fn id(&self) -> StreamId {
            self.id
        }

        fn request_sample(&self, session: &Session, rp: &RequestPacket, _: Option<StreamId>) -> Result<()> {
            self.seen.lock().push((rp.packet_number, rp.is_drain()));
            if !self.answer {
                return Ok(());
            }
            let sample = Sample::frames(MediaKind::Video, Payload::Empty, rp.packet_number as i64, 1);
            session.give_sample(self.id, Some(sample), rp, true)
        }

        fn process_sample(&self, _: &Session, _: Option<Sample>, _: &RequestPacket, _: StreamId) -> Result<()> {
            Ok(())
        }
    }

    fn topology(
        clock: &Arc<PresentationClock>,
        component: &RecorderComponent,
        source: &Arc<Source>,
    ) -> (crate::pipeline::Topology, Arc<RecorderSink>) {
        let recorder = component.create_recorder(clock);
        let mut builder = TopologyBuilder::new(Arc::clone(clock));
        let source = builder.add_stream(source.clone());
        let sink = builder.add_stream(recorder.clone());
        builder.connect(source, sink).unwrap();
        (builder.build(), recorder)
    }

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn test_ticks_pull_and_stop_drains() {
        let time = Arc::new(ManualTimeSource::new());
        let clock = clock_on(time.clone());
        let component = RecorderComponent::new("rec", FrameRate::per_second(100));
        let source = Source::new(true);
        let (topology, recorder) = topology(&clock, &component, &source);

        let session = Session::new(WorkContext::detached());
        session.install(topology).unwrap();
        session.start(Timestamp::ZERO).unwrap();

        for expected in [0, 10_000, 20_000] {
            assert_eq!(recorder.clock_sink().fire_now(), Some(Timestamp::from_micros(expected)));
            time.advance(TICK);
        }
        session.stop(time.get_current_time()).unwrap();

        let stats = component.stats();
        assert_eq!(stats.packets(), 4);
        assert_eq!(stats.drains(), 1);
        assert_eq!(stats.last_packet(), Some(4));
        assert_eq!(*source.seen.lock().last().unwrap(), (4, true));
        assert_eq!(recorder.clock_sink().pending_len(), 0);
    }

    #[test]
    fn test_outstanding_packet_skips_tick() {
        let time = Arc::new(ManualTimeSource::new());
        let clock = clock_on(time.clone());
        let component = RecorderComponent::new("rec", FrameRate::per_second(100));
        let source = Source::new(false);
        let (topology, recorder) = topology(&clock, &component, &source);

        let session = Session::new(WorkContext::detached());
        session.install(topology).unwrap();
        session.start(Timestamp::ZERO).unwrap();

        recorder.clock_sink().fire_now();
        time.advance(TICK);
        recorder.clock_sink().fire_now();

        assert_eq!(source.seen.lock().len(), 1);
        assert_eq!(component.stats().skipped_ticks(), 1);
        assert_eq!(session.health().drops(), 1);
        // still scheduled for the following tick
        assert_eq!(recorder.clock_sink().next_due(), Some(Timestamp::from_micros(20_000)));
    }

    #[test]
    fn test_switch_hands_tick_to_new_sink() {
        let time = Arc::new(ManualTimeSource::new());
        let component = RecorderComponent::new("rec", FrameRate::per_second(100));
        let source = Source::new(true);
        let clock1 = clock_on(time.clone());
        let (v1, rec1) = topology(&clock1, &component, &source);
        let clock2 = clock_on(time.clone());
        let (v2, rec2) = topology(&clock2, &component, &source);

        let session = Session::new(WorkContext::detached());
        session.install(v1).unwrap();
        session.start(Timestamp::ZERO).unwrap();
        rec1.clock_sink().fire_now();
        time.advance(TICK);
        rec1.clock_sink().fire_now();
        time.advance(TICK);

        session.queue_switch(Arc::new(v2));
        // the old sink's tick performs the switch and passes the tick on
        assert_eq!(rec1.clock_sink().fire_now(), Some(Timestamp::from_micros(20_000)));
        assert_eq!(component.stats().packets(), 2);
        assert_eq!(rec1.clock_sink().pending_len(), 0);
        assert_eq!(rec2.clock_sink().next_due(), Some(Timestamp::from_micros(20_000)));
        assert_eq!(rec2.clock_sink().pending_len(), 2);

        assert_eq!(rec2.clock_sink().fire_now(), Some(Timestamp::from_micros(20_000)));
        assert_eq!(component.stats().last_packet(), Some(3));
        time.advance(TICK);
        assert_eq!(rec2.clock_sink().fire_now(), Some(Timestamp::from_micros(30_000)));
        assert_eq!(component.stats().last_packet(), Some(4));
        assert_eq!(component.stats().skipped_ticks(), 0);
        assert_eq!(session.health().switches(), 1);
        let seen: Vec<u64> = source.seen.lock().iter().map(|(n, _)| *n).collect();
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_late_tick_keeps_ticking_on_moving_clock() {
        let time = Arc::new(crate::testing::SteppingTimeSource::new(Duration::from_micros(1)));
        let clock = clock_on(time.clone());
        let component = RecorderComponent::new("rec", FrameRate::per_second(100)).with_slack(Duration::from_millis(5));
        let source = Source::new(true);
        let (topology, recorder) = topology(&clock, &component, &source);

        let session = Session::new(WorkContext::detached());
        session.install(topology).unwrap();
        session.start(Timestamp::ZERO).unwrap();
        time.set_current_time(Timestamp::from_micros(11_000));

        assert_eq!(recorder.clock_sink().fire_now(), Some(Timestamp::ZERO));
        assert_eq!(recorder.clock_sink().next_due(), Some(Timestamp::from_micros(10_000)));
        assert_eq!(recorder.clock_sink().fire_now(), Some(Timestamp::from_micros(10_000)));
        assert_eq!(recorder.clock_sink().next_due(), Some(Timestamp::from_micros(20_000)));
        assert_eq!(component.stats().packets(), 2);
        assert_eq!(component.stats().skipped_ticks(), 0);
    }
}
