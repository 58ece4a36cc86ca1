//! Synthetic PCM source
//!
//! Produces a sine tone on demand: each request yields every sample frame
//! from where the previous reply ended up to the frame containing the
//! packet's request time. The first request only reports the position.
//! Streams of one component share that position, so the stream of an
//! incoming topology continues where the outgoing one stopped.

use std::f64::consts::TAU;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::clock::PresentationClock;
use crate::error::Result;
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::stream::{Component, ComponentId, InstanceType, Stream, StreamId};
use crate::pipeline::types::{FrameRate, MediaKind, Payload, Sample};
use crate::pool::{BufferPool, PcmBlock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub frequency: f32,
    pub amplitude: f32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 0.25,
        }
    }
}

pub struct ToneComponent {
    id: ComponentId,
    name: String,
    rate: FrameRate,
    spec: ToneSpec,
    pool: BufferPool<PcmBlock>,
    next_frame: Arc<Mutex<Option<i64>>>,
}

impl ToneComponent {
    pub fn new(name: &str, rate: FrameRate, spec: ToneSpec, pool: BufferPool<PcmBlock>) -> Arc<Self> {
        Arc::new(Self {
            id: ComponentId::next(),
            name: name.to_string(),
            rate,
            spec,
            pool,
            next_frame: Arc::new(Mutex::new(None)),
        })
    }
}

impl Component for ToneComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::NotShareable
    }

    fn create_stream(&self, _clock: Option<&Arc<PresentationClock>>) -> Result<Arc<dyn Stream>> {
        Ok(Arc::new(ToneStream {
            id: StreamId::next(),
            component: self.id,
            name: self.name.clone(),
            rate: self.rate,
            spec: self.spec,
            pool: self.pool.clone(),
            next_frame: Arc::clone(&self.next_frame),
        }))
    }
}

pub struct ToneStream {
    id: StreamId,
    component: ComponentId,
    name: String,
    rate: FrameRate,
    spec: ToneSpec,
    pool: BufferPool<PcmBlock>,
    /// First frame not yet produced, shared by the component's streams
    next_frame: Arc<Mutex<Option<i64>>>,
}

impl ToneStream {
    fn render(&self, start: i64, len: usize) -> Result<Sample> {
        let mut block = self.pool.acquire()?;
        let len = block.set_frames(len);
        let channels = block.channels() as usize;
        let step = TAU * self.spec.frequency as f64 * self.rate.den as f64 / self.rate.num as f64;
        for (i, frame) in block.samples_mut().chunks_exact_mut(channels).enumerate() {
            // phase from the absolute frame index keeps replies seamless
            let phase = ((start + i as i64) as f64 * step) % TAU;
            frame.fill(self.spec.amplitude * phase.sin() as f32);
        }
        Ok(Sample::frames(
            MediaKind::Audio,
            Payload::shared(Arc::new(block)),
            start,
            len as i64,
        ))
    }
}

impl Stream for ToneStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn component(&self) -> Option<ComponentId> {
        Some(self.component)
    }

    fn request_sample(
        &self,
        session: &Session,
        rp: &RequestPacket,
        _prev: Option<StreamId>,
    ) -> Result<()> {
        let target = self.rate.frame_at(rp.request_time);
        let (start, len) = {
            let mut next = self.next_frame.lock();
            let start = next.unwrap_or(target);
            let len = (target - start)
                .clamp(0, self.pool.shape().capacity_frames as i64);
            *next = Some(start + len);
            (start, len as usize)
        };

        let sample = if len == 0 {
            Sample::frames(MediaKind::Audio, Payload::Empty, start, 0)
        } else {
            self.render(start, len)?
        };
        if start + len as i64 != target {
            debug!(
                "{} behind by {} frames at packet {}",
                self.name,
                target - start - len as i64,
                rp.packet_number
            );
        }
        trace!("{} -> [{}, {}) for packet {}", self.name, start, start + len as i64, rp.packet_number);
        session.give_sample(self.id, Some(sample), rp, true)
    }

    fn process_sample(
        &self,
        _session: &Session,
        _sample: Option<Sample>,
        _rp: &RequestPacket,
        _prev: StreamId,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::topology::{Topology, TopologyBuilder};
    use crate::pipeline::types::Timestamp;
    use crate::pool::PcmShape;
    use crate::testing::test_clock;
    use crate::work::WorkContext;

    /// Sink keeping every reply
    struct Collect {
        id: StreamId,
        got: Mutex<Vec<Sample>>,
    }

    impl Stream for Collect {
        fn id(&self) -> StreamId {
            self.id
        }

        fn request_sample(&self, _: &Session, _: &RequestPacket, _: Option<StreamId>) -> Result<()> {
            Ok(())
        }

        fn process_sample(&self, _: &Session, sample: Option<Sample>, _: &RequestPacket, _: StreamId) -> Result<()> {
            self.got.lock().extend(sample);
            Ok(())
        }
    }

    fn tone_into_collector(tone: &Arc<ToneComponent>) -> (Topology, StreamId, Arc<Collect>) {
        let mut builder = TopologyBuilder::new(test_clock());
        let source = builder.instantiate(tone.clone()).unwrap();
        let sink = Arc::new(Collect {
            id: StreamId::next(),
            got: Mutex::new(Vec::new()),
        });
        let sink_id = builder.add_stream(sink.clone());
        builder.connect(source, sink_id).unwrap();
        (builder.build(), sink_id, sink)
    }

    #[test]
    fn test_switched_tone_continues_position() {
        let pool = BufferPool::new(
            "tone",
            PcmShape {
                channels: 1,
                capacity_frames: 1_000,
            },
        );
        let tone = ToneComponent::new("tone", FrameRate::per_second(1_000), ToneSpec::default(), pool);
        let (v1, first_sink, first) = tone_into_collector(&tone);
        let (v2, second_sink, second) = tone_into_collector(&tone);

        let session = Session::new(WorkContext::detached());
        session.install(v1).unwrap();
        for (sink, ms) in [(first_sink, 10), (first_sink, 30)] {
            let mut rp = RequestPacket::new(Timestamp::from_micros(ms * 1_000));
            session.request_sample(sink, &mut rp, true).unwrap();
        }
        session.switch_topology_immediate(Arc::new(v2), Timestamp::ZERO).unwrap();
        let mut rp = RequestPacket::new(Timestamp::from_micros(45_000));
        session.request_sample(second_sink, &mut rp, true).unwrap();

        assert_eq!(first.got.lock()[1].frame_range(), Some(10..30));
        assert_eq!(second.got.lock()[0].frame_range(), Some(30..45));
    }

    #[test]
    fn test_tone_is_contiguous_and_bounded() {
        let pool = BufferPool::new(
            "tone",
            PcmShape {
                channels: 2,
                capacity_frames: 100,
            },
        );
        let rate = FrameRate::per_second(1_000);
        let tone = ToneComponent::new("tone", rate, ToneSpec::default(), pool.clone());

        let mut builder = TopologyBuilder::new(test_clock());
        let source = builder.instantiate(tone).unwrap();
        let sink = Arc::new(Collect {
            id: StreamId::next(),
            got: Mutex::new(Vec::new()),
        });
        let sink_id = builder.add_stream(sink.clone());
        builder.connect(source, sink_id).unwrap();

        let session = Session::new(WorkContext::detached());
        session.install(builder.build()).unwrap();
        for ms in [10, 50, 250] {
            let mut rp = RequestPacket::new(Timestamp::from_micros(ms * 1_000));
            session.request_sample(sink_id, &mut rp, true).unwrap();
        }

        let got = sink.got.lock();
        let ranges: Vec<_> = got.iter().map(|s| s.frame_range().unwrap()).collect();
        // 10ms marker, 40 frames, then capped at the block capacity
        assert_eq!(ranges, vec![10..10, 10..50, 50..150]);
        assert!(got[1].payload.downcast_ref::<crate::pool::PooledBuffer<PcmBlock>>().is_some());
        assert_eq!(pool.checked_out(), 2);
    }
}
