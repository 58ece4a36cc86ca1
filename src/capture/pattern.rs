//! Synthetic video source
//!
//! Renders scrolling colour bars into pooled RGBA frames. Rendering runs on
//! the capture work queue behind a [`CapacityGate`]; a request that finds no
//! free worker is answered at once with a zero-length marker and the next
//! rendered frame carries a discontinuity.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::clock::PresentationClock;
use crate::error::Result;
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::stream::{CapacityGate, Component, ComponentId, InstanceType, Stream, StreamId};
use crate::pipeline::types::{FrameRate, MediaKind, Payload, Sample};
use crate::pool::{BufferPool, PooledBuffer, RgbaFrame};
use crate::work::{AsyncWork, WorkQueue};

const BARS: [[u8; 4]; 8] = [
    [235, 235, 235, 255],
    [235, 235, 16, 255],
    [16, 235, 235, 255],
    [16, 235, 16, 255],
    [235, 16, 235, 255],
    [235, 16, 16, 255],
    [16, 16, 235, 255],
    [16, 16, 16, 255],
];

pub struct PatternComponent {
    id: ComponentId,
    name: String,
    rate: FrameRate,
    pool: BufferPool<RgbaFrame>,
    work: Arc<dyn AsyncWork>,
    workers: usize,
    alpha: u8,
}

impl PatternComponent {
    pub fn new(
        name: &str,
        rate: FrameRate,
        pool: BufferPool<RgbaFrame>,
        work: Arc<dyn AsyncWork>,
    ) -> Self {
        Self {
            id: ComponentId::next(),
            name: name.to_string(),
            rate,
            pool,
            work,
            workers: 1,
            alpha: 255,
        }
    }

    /// Concurrent renders allowed
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_alpha(mut self, alpha: u8) -> Self {
        self.alpha = alpha;
        self
    }
}

impl Component for PatternComponent {
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
        Ok(Arc::new(PatternStream {
            id: StreamId::next(),
            component: self.id,
            name: self.name.clone(),
            rate: self.rate,
            pool: self.pool.clone(),
            work: Arc::clone(&self.work),
            gate: Arc::new(CapacityGate::new(self.workers)),
            alpha: self.alpha,
            next_frame: Mutex::new(None),
        }))
    }
}

pub struct PatternStream {
    id: StreamId,
    component: ComponentId,
    name: String,
    rate: FrameRate,
    pool: BufferPool<RgbaFrame>,
    work: Arc<dyn AsyncWork>,
    gate: Arc<CapacityGate>,
    alpha: u8,
    next_frame: Mutex<Option<i64>>,
}

impl PatternStream {
    pub fn gate(&self) -> &Arc<CapacityGate> {
        &self.gate
    }

    fn marker(&self, position: i64) -> Sample {
        Sample::frames(MediaKind::Video, Payload::Empty, position, 0)
    }
}

/// Colour bars shifted one column per frame
pub fn render_bars(frame: &mut RgbaFrame, index: i64, alpha: u8) {
    let width = frame.width().max(1) as i64;
    let bar = (width / BARS.len() as i64).max(1);
    for x in 0..frame.width() {
        let column = (x as i64 + index).rem_euclid(width);
        let mut rgba = BARS[((column / bar) as usize).min(BARS.len() - 1)];
        rgba[3] = alpha;
        for y in 0..frame.height() {
            frame.put_pixel(x, y, rgba);
        }
    }
}

impl Stream for PatternStream {
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
        let wanted = self.rate.frame_at(rp.request_time);
        let (index, skipped) = {
            let mut next = self.next_frame.lock();
            let expected = next.unwrap_or(wanted);
            if wanted < expected {
                drop(next);
                trace!("{} already produced frame {}", self.name, wanted);
                return session.give_sample(self.id, Some(self.marker(expected)), rp, true);
            }
            *next = Some(wanted + 1);
            (wanted, wanted > expected)
        };

        let Some(permit) = self.gate.try_acquire() else {
            let dropped = self.gate.record_drop();
            session.health().record_drop();
            debug!("{} has no free renderer, dropped frame {} ({} total)", self.name, index, dropped);
            return session.give_sample(self.id, Some(self.marker(index + 1)), rp, true);
        };
        let Some(session) = session.handle() else {
            return Ok(());
        };

        let id = self.id;
        let name = self.name.clone();
        let pool = self.pool.clone();
        let gate = Arc::clone(&self.gate);
        let alpha = self.alpha;
        let rp = rp.clone();
        self.work.submit(
            WorkQueue::Capture,
            Box::new(move || {
                let _permit = permit;
                if !session.context().is_active() {
                    return;
                }
                let result = pool.acquire().and_then(|mut frame| {
                    render_bars(&mut frame, index, alpha);
                    let discontinuity = gate.take_discontinuity() || skipped;
                    let sample = Sample::frames(
                        MediaKind::Video,
                        Payload::shared(Arc::new(frame)),
                        index,
                        1,
                    )
                    .with_discontinuity(discontinuity);
                    session.give_sample(id, Some(sample), &rp, true)
                });
                if let Err(e) = result {
                    if e.is_fatal() {
                        session.report(&name, e);
                    } else {
                        debug!("{} frame {}: {}", name, index, e);
                    }
                }
            }),
        );
        Ok(())
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

/// Downcast a video payload produced by this module or a video mixer
pub fn frame_of(sample: &Sample) -> Option<&PooledBuffer<RgbaFrame>> {
    sample.payload.downcast_ref::<PooledBuffer<RgbaFrame>>()
}
