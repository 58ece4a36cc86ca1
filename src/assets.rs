use crate::pipeline::types::FrameRate;
use crate::pool::FrameSize;

pub const VIDEO_RATE: FrameRate = FrameRate::new(30, 1);
pub const CANVAS: FrameSize = FrameSize::new(320, 180);

// audio
pub const AUDIO_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: u16 = 2;
pub const AUDIO_SINK_RATE: u32 = 50;

pub const POOL_PREALLOC: usize = 4;
pub const TICK_SLACK_MS: u64 = 2;
pub const CAPTURE_THREADS: usize = 1;

pub const BACKGROUND: [u8; 4] = [0, 0, 0, 255];
