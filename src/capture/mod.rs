//! Synthetic capture sources
//!
//! Stand-ins for capture devices with the same pull behaviour: the tone
//! source answers synchronously, the pattern source renders on a worker and
//! answers later.

pub mod pattern;
pub mod tone;

pub use pattern::{PatternComponent, PatternStream, frame_of, render_bars};
pub use tone::{ToneComponent, ToneSpec, ToneStream};
