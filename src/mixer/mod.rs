//! Generic synchronized mixer
//!
//! A mixer combines K independently-timed inputs into one frame-accurate
//! output. The frame bookkeeping (cutoff, leftovers, late data, drain) lives
//! once in [`MixerEngine`]; what "combining" means is supplied by a
//! [`MixKernel`]:
//! - [`AudioMixKernel`]: sums and clamps PCM
//! - [`VideoMixKernel`]: composites frames with per-input affine transforms

mod audio;
mod engine;
mod stream;
mod transform;
mod video;

pub use audio::{AudioMixKernel, AudioPacket};
pub use engine::{MixOutcome, MixerEngine};
pub use stream::{MixerInlet, MixerStream};
pub use transform::Affine2x3;
pub use video::{TransformHandle, VideoMixKernel, VideoPacket};

use std::ops::Range;

use crate::error::Result;
use crate::pipeline::packet::RequestPacket;
use crate::pipeline::types::Sample;

/// Media-specific half of a mixer
pub trait MixKernel: Send + 'static {
    /// Frame-positioned unit of input data
    type Packet: Send + 'static;

    /// Turn one input sample (already in frame units) into packets.
    /// Zero-length samples only mark the input's position and yield nothing.
    fn unpack(&mut self, input: usize, sample: Sample) -> Result<Vec<Self::Packet>>;

    fn frame_range(&self, packet: &Self::Packet) -> Range<i64>;

    /// Split `packet` at frame `at` into the part before and the part from `at`
    fn move_frames(
        &self,
        packet: Self::Packet,
        at: i64,
    ) -> (Option<Self::Packet>, Option<Self::Packet>);

    /// Produce exactly one output spanning `window`. `inputs[i]` holds input
    /// `i`'s packets inside the window, in arrival order.
    fn mix(
        &mut self,
        window: Range<i64>,
        inputs: &[Vec<Self::Packet>],
        rp: &RequestPacket,
    ) -> Result<Sample>;
}
