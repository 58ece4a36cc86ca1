//! Processing and sink workers
//!
//! The encoder is a pass-through transform that works on the default queue;
//! the recorder is a clock-driven sink that pulls the graph.

pub mod encoder;
pub mod recorder;

pub use encoder::{EncodeStream, EncoderComponent, FrameEncoder, RleEncoder};
pub use recorder::{RecorderComponent, RecorderSink, RecorderStats};
