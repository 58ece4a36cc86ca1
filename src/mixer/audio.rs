use std::ops::Range;
use std::sync::Arc;

use log::trace;

use super::MixKernel;
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::types::{MediaKind, Payload, Sample};
use crate::pool::{BufferPool, PcmBlock, PcmShape, PooledBuffer};

/// Slice of a pooled PCM block, positioned in sample frames
#[derive(Clone)]
pub struct AudioPacket {
    block: Arc<PooledBuffer<PcmBlock>>,
    /// First frame of `range` inside `block`
    offset: usize,
    range: Range<i64>,
}

impl std::fmt::Debug for AudioPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPacket")
            .field("offset", &self.offset)
            .field("range", &self.range)
            .finish()
    }
}

/// Sums interleaved f32 PCM and clamps to `[-1, 1]`
///
/// Inputs must carry `PooledBuffer<PcmBlock>` payloads with the mixer's
/// channel count; silent samples contribute nothing. Output blocks come from
/// `pool`, whose capacity bounds the largest window one commit can produce.
pub struct AudioMixKernel {
    pool: BufferPool<PcmBlock>,
    channels: u16,
    discontinuity: bool,
}

impl AudioMixKernel {
    pub fn new(pool: BufferPool<PcmBlock>) -> Self {
        let channels = pool.shape().channels;
        Self {
            pool,
            channels,
            discontinuity: false,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl MixKernel for AudioMixKernel {
    type Packet = AudioPacket;

    fn unpack(&mut self, input: usize, sample: Sample) -> Result<Vec<AudioPacket>> {
        self.discontinuity |= sample.discontinuity;
        if sample.silent || sample.duration == 0 {
            return Ok(Vec::new());
        }
        let Some(block) = sample.payload.downcast_arc::<PooledBuffer<PcmBlock>>() else {
            return Err(PipelineError::contract(format!(
                "audio mixer input {} carries {:?}, not a PCM block",
                input, sample.payload
            )));
        };
        if block.channels() != self.channels {
            return Err(PipelineError::ShapeMismatch {
                pool: self.pool.name().to_string(),
                expected: format!("{} channels", self.channels),
                requested: format!("{} channels", block.channels()),
            });
        }
        let frames = (sample.duration as usize).min(block.frames());
        if frames == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![AudioPacket {
            block,
            offset: 0,
            range: sample.position..sample.position + frames as i64,
        }])
    }

    fn frame_range(&self, packet: &AudioPacket) -> Range<i64> {
        packet.range.clone()
    }

    fn move_frames(
        &self,
        packet: AudioPacket,
        at: i64,
    ) -> (Option<AudioPacket>, Option<AudioPacket>) {
        if at <= packet.range.start {
            return (None, Some(packet));
        }
        if at >= packet.range.end {
            return (Some(packet), None);
        }
        let split = (at - packet.range.start) as usize;
        let after = AudioPacket {
            block: Arc::clone(&packet.block),
            offset: packet.offset + split,
            range: at..packet.range.end,
        };
        let before = AudioPacket {
            range: packet.range.start..at,
            ..packet
        };
        (Some(before), Some(after))
    }

    fn mix(
        &mut self,
        window: Range<i64>,
        inputs: &[Vec<AudioPacket>],
        rp: &RequestPacket,
    ) -> Result<Sample> {
        let len = (window.end - window.start) as usize;
        let mut out = self.pool.acquire()?;
        if len > out.capacity_frames() {
            return Err(PipelineError::ShapeMismatch {
                pool: self.pool.name().to_string(),
                expected: format!("{:?}", self.pool.shape()),
                requested: format!(
                    "{:?}",
                    PcmShape {
                        channels: self.channels,
                        capacity_frames: len,
                    }
                ),
            });
        }
        out.set_frames(len);

        let ch = self.channels as usize;
        let mut contributing = 0;
        {
            let dst = out.samples_mut();
            for packets in inputs {
                if !packets.is_empty() {
                    contributing += 1;
                }
                for packet in packets {
                    let frames = (packet.range.end - packet.range.start) as usize;
                    let dst_start = (packet.range.start - window.start) as usize * ch;
                    let src_start = packet.offset * ch;
                    let src = &packet.block.samples()[src_start..src_start + frames * ch];
                    for (d, s) in dst[dst_start..dst_start + frames * ch].iter_mut().zip(src) {
                        *d += *s;
                    }
                }
            }
            for v in dst.iter_mut() {
                *v = v.clamp(-1.0, 1.0);
            }
        }
        trace!(
            "audio mix {:?} from {} inputs for packet {}",
            window, contributing, rp.packet_number
        );

        let mut sample = Sample::frames(
            MediaKind::Audio,
            Payload::shared(Arc::new(out)),
            window.start,
            len as i64,
        );
        sample.silent = contributing == 0;
        sample.discontinuity = std::mem::take(&mut self.discontinuity);
        Ok(sample)
    }
}
