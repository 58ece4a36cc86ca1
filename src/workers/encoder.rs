//! Encode branch
//!
//! Sits between a video mixer and its sink. Requests always travel upstream;
//! encoding runs on the default work queue behind a [`CapacityGate`]. A frame
//! that arrives while every encoder slot is busy is dropped: the sink gets an
//! empty reply for that packet and the next encoded frame is a keyframe
//! flagged as a discontinuity.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::capture::frame_of;
use crate::clock::PresentationClock;
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::session::Session;
use crate::pipeline::stream::{CapacityGate, Component, ComponentId, InstanceType, Stream, StreamId};
use crate::pipeline::types::{Payload, Sample};
use crate::pool::RgbaFrame;
use crate::work::{AsyncWork, WorkQueue};

/// Codec boundary; concrete codecs live outside this crate
pub trait FrameEncoder: Send {
    fn name(&self) -> &str;

    fn encode(&mut self, frame: &RgbaFrame, keyframe: bool) -> Result<Bytes>;
}

/// Run-length coder over RGBA pixels.
///
/// Output: one flag byte (1 = keyframe), then `(run, r, g, b, a)` records with
/// `run` in `1..=255`. Delta frames encode unchanged pixels as `a = 0` runs
/// against the previous frame.
#[derive(Default)]
pub struct RleEncoder {
    previous: Vec<u8>,
}

impl RleEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameEncoder for RleEncoder {
    fn name(&self) -> &str {
        "rle"
    }

    fn encode(&mut self, frame: &RgbaFrame, keyframe: bool) -> Result<Bytes> {
        let data = frame.data();
        let keyframe = keyframe || self.previous.len() != data.len();
        let mut out = BytesMut::with_capacity(1 + data.len() / 4);
        out.put_u8(keyframe as u8);

        let mut run: Option<([u8; 4], u8)> = None;
        for (i, px) in data.chunks_exact(4).enumerate() {
            let mut rgba = [px[0], px[1], px[2], px[3]];
            if !keyframe && self.previous[i * 4..i * 4 + 4] == rgba {
                rgba = [0, 0, 0, 0];
            }
            run = match run {
                Some((value, n)) if value == rgba && n < u8::MAX => Some((value, n + 1)),
                Some((value, n)) => {
                    out.put_u8(n);
                    out.put_slice(&value);
                    Some((rgba, 1))
                }
                None => Some((rgba, 1)),
            };
        }
        if let Some((value, n)) = run {
            out.put_u8(n);
            out.put_slice(&value);
        }

        self.previous.clear();
        self.previous.extend_from_slice(data);
        Ok(out.freeze())
    }
}

/// Encoder shared by every topology that instantiates it
pub struct EncoderComponent {
    id: ComponentId,
    name: String,
    work: Arc<dyn AsyncWork>,
    encoder: Arc<Mutex<Box<dyn FrameEncoder>>>,
    gate: Arc<CapacityGate>,
}

impl EncoderComponent {
    pub fn new(
        name: &str,
        encoder: Box<dyn FrameEncoder>,
        work: Arc<dyn AsyncWork>,
        slots: usize,
    ) -> Arc<Self> {
        debug!("Encoder '{}' uses {} with {} slots", name, encoder.name(), slots);
        Arc::new(Self {
            id: ComponentId::next(),
            name: name.to_string(),
            work,
            encoder: Arc::new(Mutex::new(encoder)),
            gate: Arc::new(CapacityGate::new(slots)),
        })
    }

    pub fn gate(&self) -> &Arc<CapacityGate> {
        &self.gate
    }
}

impl Component for EncoderComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_type(&self) -> InstanceType {
        InstanceType::Shareable
    }

    fn create_stream(&self, _clock: Option<&Arc<PresentationClock>>) -> Result<Arc<dyn Stream>> {
        Ok(Arc::new(EncodeStream {
            id: StreamId::next(),
            component: self.id,
            name: self.name.clone(),
            work: Arc::clone(&self.work),
            encoder: Arc::clone(&self.encoder),
            gate: Arc::clone(&self.gate),
        }))
    }
}

pub struct EncodeStream {
    id: StreamId,
    component: ComponentId,
    name: String,
    work: Arc<dyn AsyncWork>,
    encoder: Arc<Mutex<Box<dyn FrameEncoder>>>,
    gate: Arc<CapacityGate>,
}

fn encode_sample(
    encoder: &Mutex<Box<dyn FrameEncoder>>,
    sample: Sample,
    keyframe: bool,
) -> Result<Sample> {
    let Some(frame) = frame_of(&sample) else {
        return Err(PipelineError::contract(format!(
            "encoder input carries {:?}, not an RGBA frame",
            sample.payload
        )));
    };
    let bytes = encoder.lock().encode(frame, keyframe)?;
    Ok(Sample {
        payload: Payload::Bytes(bytes),
        discontinuity: sample.discontinuity || keyframe,
        ..sample
    })
}

impl Stream for EncodeStream {
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
        session.request_upstream(self.id, rp)
    }

    fn process_sample(
        &self,
        session: &Session,
        sample: Option<Sample>,
        rp: &RequestPacket,
        _prev: StreamId,
    ) -> Result<()> {
        let Some(sample) = sample.filter(|s| !s.silent && s.duration > 0) else {
            return session.give_sample(self.id, None, rp, false);
        };

        let Some(permit) = self.gate.try_acquire() else {
            let dropped = self.gate.record_drop();
            session.health().record_drop();
            debug!(
                "{}: all {} slots busy, dropped packet {} ({} total)",
                self.name,
                self.gate.slots(),
                rp.packet_number,
                dropped
            );
            return session.give_sample(self.id, None, rp, false);
        };
        let Some(session) = session.handle() else {
            return Ok(());
        };

        let id = self.id;
        let name = self.name.clone();
        let encoder = Arc::clone(&self.encoder);
        let keyframe = self.gate.take_discontinuity() || sample.discontinuity;
        let rp = rp.clone();
        self.work.submit(
            WorkQueue::Default,
            Box::new(move || {
                let _permit = permit;
                if !session.context().is_active() {
                    return;
                }
                let result = encode_sample(&encoder, sample, keyframe).and_then(|encoded| {
                    trace!("{} packet {}: {:?}", name, rp.packet_number, encoded.payload);
                    session.give_sample(id, Some(encoded), &rp, false)
                });
                if let Err(e) = result {
                    warn!("{} failed on packet {}: {}", name, rp.packet_number, e);
                    if e.is_fatal() {
                        session.report(&name, e);
                    }
                }
            }),
        );
        Ok(())
    }
}
