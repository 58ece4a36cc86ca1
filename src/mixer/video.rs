use std::ops::Range;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{trace, warn};

use super::{Affine2x3, MixKernel};
use crate::error::{PipelineError, Result};
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::types::{MediaKind, Payload, Sample};
use crate::pool::{BufferPool, PooledBuffer, RgbaFrame};

/// Live transform of one video input; swapping it takes effect on the next mix
pub type TransformHandle = Arc<ArcSwap<Affine2x3>>;

/// One RGBA frame held over a frame range
#[derive(Clone)]
pub struct VideoPacket {
    frame: Arc<PooledBuffer<RgbaFrame>>,
    range: Range<i64>,
}

impl std::fmt::Debug for VideoPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoPacket")
            .field("size", &self.frame.size())
            .field("range", &self.range)
            .finish()
    }
}

/// Composites inputs bottom to top (input 0 first) onto a pooled canvas.
///
/// Each input is placed through its own [`Affine2x3`]. An input with no frame
/// inside the window keeps showing its last frame, so the most recent frame of
/// every input stays checked out of its pool until the kernel is dropped.
pub struct VideoMixKernel {
    pool: BufferPool<RgbaFrame>,
    background: [u8; 4],
    transforms: Vec<TransformHandle>,
    last: Vec<Option<Arc<PooledBuffer<RgbaFrame>>>>,
    discontinuity: bool,
}

impl VideoMixKernel {
    pub fn new(pool: BufferPool<RgbaFrame>, inputs: usize) -> Self {
        Self {
            pool,
            background: [0, 0, 0, 255],
            transforms: (0..inputs)
                .map(|_| Arc::new(ArcSwap::from_pointee(Affine2x3::IDENTITY)))
                .collect(),
            last: vec![None; inputs],
            discontinuity: false,
        }
    }

    pub fn with_background(mut self, rgba: [u8; 4]) -> Self {
        self.background = rgba;
        self
    }

    /// Handle to input `input`'s transform
    pub fn transform(&self, input: usize) -> Option<TransformHandle> {
        self.transforms.get(input).cloned()
    }

    fn draw(canvas: &mut RgbaFrame, src: &RgbaFrame, transform: &Affine2x3) {
        let Some(inverse) = transform.invert() else {
            return;
        };
        let (x0, y0, x1, y1) = transform.bounds(src.width() as f32, src.height() as f32);
        let cx0 = x0.floor().max(0.0) as u32;
        let cy0 = y0.floor().max(0.0) as u32;
        let cx1 = (x1.ceil().max(0.0) as u32).min(canvas.width());
        let cy1 = (y1.ceil().max(0.0) as u32).min(canvas.height());

        for y in cy0..cy1 {
            for x in cx0..cx1 {
                // sample at the pixel centre
                let (sx, sy) = inverse.apply(x as f32 + 0.5, y as f32 + 0.5);
                if sx < 0.0 || sy < 0.0 {
                    continue;
                }
                let (sx, sy) = (sx as u32, sy as u32);
                if sx >= src.width() || sy >= src.height() {
                    continue;
                }
                let over = blend(src.pixel(sx, sy), canvas.pixel(x, y));
                canvas.put_pixel(x, y, over);
            }
        }
    }
}

/// Straight-alpha "over"
fn blend(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let a = src[3] as u32;
    if a == 255 {
        return src;
    }
    if a == 0 {
        return dst;
    }
    let inv = 255 - a;
    let mut out = [0u8; 4];
    for c in 0..3 {
        out[c] = ((src[c] as u32 * a + dst[c] as u32 * inv + 127) / 255) as u8;
    }
    out[3] = (a + (dst[3] as u32 * inv + 127) / 255) as u8;
    out
}

impl MixKernel for VideoMixKernel {
    type Packet = VideoPacket;

    fn unpack(&mut self, input: usize, sample: Sample) -> Result<Vec<VideoPacket>> {
        self.discontinuity |= sample.discontinuity;
        if sample.silent || sample.duration == 0 {
            return Ok(Vec::new());
        }
        let Some(frame) = sample.payload.downcast_arc::<PooledBuffer<RgbaFrame>>() else {
            return Err(PipelineError::contract(format!(
                "video mixer input {} carries {:?}, not an RGBA frame",
                input, sample.payload
            )));
        };
        Ok(vec![VideoPacket {
            frame,
            range: sample.position..sample.end(),
        }])
    }

    fn frame_range(&self, packet: &VideoPacket) -> Range<i64> {
        packet.range.clone()
    }

    fn move_frames(
        &self,
        packet: VideoPacket,
        at: i64,
    ) -> (Option<VideoPacket>, Option<VideoPacket>) {
        if at <= packet.range.start {
            return (None, Some(packet));
        }
        if at >= packet.range.end {
            return (Some(packet), None);
        }
        let after = VideoPacket {
            frame: Arc::clone(&packet.frame),
            range: at..packet.range.end,
        };
        let before = VideoPacket {
            range: packet.range.start..at,
            ..packet
        };
        (Some(before), Some(after))
    }

    fn mix(
        &mut self,
        window: Range<i64>,
        inputs: &[Vec<VideoPacket>],
        rp: &RequestPacket,
    ) -> Result<Sample> {
        let mut canvas = self.pool.acquire()?;
        canvas.fill(self.background);

        for (i, packets) in inputs.iter().enumerate() {
            if let Some(latest) = packets.iter().max_by_key(|p| p.range.start) {
                self.last[i] = Some(Arc::clone(&latest.frame));
            }
            let Some(frame) = self.last.get(i).and_then(Option::as_ref) else {
                continue;
            };
            let transform = self.transforms[i].load();
            if transform.invert().is_none() {
                warn!("video mixer input {} has a degenerate transform", i);
                continue;
            }
            Self::draw(&mut canvas, frame, &transform);
        }
        trace!(
            "video mix {:?} of {} inputs for packet {}",
            window,
            inputs.len(),
            rp.packet_number
        );

        let mut sample = Sample::frames(
            MediaKind::Video,
            Payload::shared(Arc::new(canvas)),
            window.start,
            window.end - window.start,
        );
        sample.discontinuity = std::mem::take(&mut self.discontinuity);
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::MixerEngine;
    use crate::pipeline::types::{FrameRate, Timestamp};
    use crate::pool::FrameSize;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLACK: [u8; 4] = [0, 0, 0, 255];

    fn frame(pool: &BufferPool<RgbaFrame>, rgba: [u8; 4], start: i64, len: i64) -> Option<Sample> {
        let mut buf = pool.acquire().unwrap();
        buf.fill(rgba);
        Some(Sample::frames(
            MediaKind::Video,
            Payload::shared(Arc::new(buf)),
            start,
            len,
        ))
    }

    fn marker(position: i64) -> Option<Sample> {
        Some(Sample::frames(MediaKind::Video, Payload::Empty, position, 0))
    }

    fn canvas(sample: &Sample) -> &PooledBuffer<RgbaFrame> {
        sample.payload.downcast_ref::<PooledBuffer<RgbaFrame>>().unwrap()
    }

    fn rp() -> RequestPacket {
        RequestPacket::new(Timestamp::ZERO)
    }

    #[test]
    fn test_translated_input_lands_on_canvas() {
        let sources = BufferPool::<RgbaFrame>::new("src", FrameSize::new(2, 2));
        let kernel = VideoMixKernel::new(BufferPool::new("canvas", FrameSize::new(4, 4)), 1);
        kernel
            .transform(0)
            .unwrap()
            .store(Arc::new(Affine2x3::translate(1.0, 1.0)));
        let mut engine = MixerEngine::new(kernel, FrameRate::per_second(30), 1);

        let out = engine.commit(&rp(), vec![frame(&sources, RED, 0, 1)]).unwrap();
        let sample = out.output.unwrap();
        let c = canvas(&sample);
        assert_eq!(c.pixel(0, 0), BLACK);
        assert_eq!(c.pixel(1, 1), RED);
        assert_eq!(c.pixel(2, 2), RED);
        assert_eq!(c.pixel(3, 3), BLACK);
    }

    #[test]
    fn test_last_frame_repeats_and_transform_swaps() {
        let sources = BufferPool::<RgbaFrame>::new("src", FrameSize::new(1, 1));
        let kernel = VideoMixKernel::new(BufferPool::new("canvas", FrameSize::new(2, 1)), 2);
        let handle = kernel.transform(1).unwrap();
        let mut engine = MixerEngine::new(kernel, FrameRate::per_second(30), 2);

        engine
            .commit(&rp(), vec![frame(&sources, RED, 0, 1), frame(&sources, RED, 0, 1)])
            .unwrap();
        handle.store(Arc::new(Affine2x3::translate(1.0, 0.0)));

        // input 1 only reports its position; its previous frame is reused
        let out = engine
            .commit(&rp(), vec![frame(&sources, BLACK, 1, 1), marker(2)])
            .unwrap();
        let sample = out.output.unwrap();
        assert_eq!(canvas(&sample).pixel(0, 0), BLACK);
        assert_eq!(canvas(&sample).pixel(1, 0), RED);
        // the cached frame of each input stays checked out
        drop(sample);
        assert_eq!(sources.checked_out(), 2);
    }

    #[test]
    fn test_half_alpha_blends() {
        assert_eq!(blend([255, 0, 0, 128], [0, 0, 255, 255]), [128, 0, 127, 255]);
        assert_eq!(blend([1, 2, 3, 0], BLACK), BLACK);
    }
}
