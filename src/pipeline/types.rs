//! Core types for the pipeline system

use bytes::Bytes;
use std::any::Any;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MICROS_PER_SEC: i128 = 1_000_000;

/// Timestamp representation for media samples and clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Microseconds since the clock domain started
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since the clock base
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        let duration = instant.saturating_duration_since(base);
        Self::from_duration(duration)
    }

    /// Convert to duration, negative timestamps clamp to zero
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Subtract a duration from this timestamp
    pub fn sub(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros - duration.as_micros() as i64,
        }
    }

    /// Time remaining until `self`, zero when `self` is not after `now`
    pub fn saturating_since(&self, now: Timestamp) -> Duration {
        Duration::from_micros((self.micros - now.micros).max(0) as u64)
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Rational frame (or sample) rate: `num / den` units per second
///
/// All conversions go through the integer frame index, so periodic schedules
/// built on top of it never accumulate rounding error, even for rates such as
/// 30000/1001.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Whole-number rate such as an audio sample rate
    pub const fn per_second(num: u32) -> Self {
        Self { num, den: 1 }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Index of the frame that contains `t`
    pub fn frame_at(&self, t: Timestamp) -> i64 {
        let scaled = t.micros as i128 * self.num as i128;
        scaled.div_euclid(self.den as i128 * MICROS_PER_SEC) as i64
    }

    /// Start time of `frame`, rounded up so that `frame_at(time_of(f)) == f`
    pub fn time_of(&self, frame: i64) -> Timestamp {
        let scaled = frame as i128 * self.den as i128 * MICROS_PER_SEC;
        let num = self.num as i128;
        let micros = -((-scaled).div_euclid(num));
        Timestamp::from_micros(micros as i64)
    }

    /// First frame boundary strictly after `t`
    pub fn next_boundary_after(&self, t: Timestamp) -> (i64, Timestamp) {
        let frame = self.frame_at(t) + 1;
        (frame, self.time_of(frame))
    }

    /// Nominal duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros((self.den as u64 * 1_000_000) / self.num.max(1) as u64)
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}/s", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Unit in which a sample's position and duration are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleUnit {
    /// Frame (video) or sample-frame (audio) indices
    Frames,
    /// Microseconds on the presentation clock
    Micros,
}

/// Opaque sample payload
///
/// Payloads are cheap to clone. A `Shared` payload keeps its host alive, which
/// is how pooled buffers travel through the graph and return to their pool
/// once the last holder lets go.
#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    Shared(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    pub fn shared<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Payload::Shared(value)
    }

    /// Borrow the shared host as `T`
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Payload::Shared(host) => host.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Clone the shared host as `Arc<T>`
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Payload::Shared(host) => Arc::clone(host).downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Bytes(b) => b.is_empty(),
            Payload::Shared(_) => false,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Bytes(b) => write!(f, "Bytes({})", b.len()),
            Payload::Shared(_) => write!(f, "Shared"),
        }
    }
}

/// One unit of media flowing between streams
#[derive(Debug, Clone)]
pub struct Sample {
    pub kind: MediaKind,
    pub payload: Payload,
    /// Start, in `unit`
    pub position: i64,
    /// Length, in `unit`
    pub duration: i64,
    pub unit: SampleUnit,
    /// The payload carries no signal (mixers treat it as silence/transparent)
    pub silent: bool,
    /// Data before this sample was lost or skipped
    pub discontinuity: bool,
}

impl Sample {
    /// Sample covering the frame range `[start, start + len)`
    pub fn frames(kind: MediaKind, payload: Payload, start: i64, len: i64) -> Self {
        Self {
            kind,
            payload,
            position: start,
            duration: len.max(0),
            unit: SampleUnit::Frames,
            silent: false,
            discontinuity: false,
        }
    }

    /// Sample positioned in clock time
    pub fn timed(kind: MediaKind, payload: Payload, pts: Timestamp, duration: Duration) -> Self {
        Self {
            kind,
            payload,
            position: pts.micros,
            duration: duration.as_micros() as i64,
            unit: SampleUnit::Micros,
            silent: false,
            discontinuity: false,
        }
    }

    /// Silent placeholder covering `[start, start + len)`
    pub fn silence(kind: MediaKind, start: i64, len: i64) -> Self {
        Self {
            silent: true,
            ..Self::frames(kind, Payload::Empty, start, len)
        }
    }

    pub fn with_discontinuity(mut self, discontinuity: bool) -> Self {
        self.discontinuity |= discontinuity;
        self
    }

    pub fn end(&self) -> i64 {
        self.position + self.duration
    }

    /// Frame range, if the sample is positioned in frames
    pub fn frame_range(&self) -> Option<Range<i64>> {
        match self.unit {
            SampleUnit::Frames => Some(self.position..self.end()),
            SampleUnit::Micros => None,
        }
    }
}
