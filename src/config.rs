use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::assets;
use crate::pipeline::types::FrameRate;
use crate::pool::FrameSize;

/// Settings of the demo pipeline, loaded from JSON
///
/// Every field has a default, so a config file only names what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub video_rate: FrameRate,
    /// Audio sample rate in Hz
    pub audio_rate: u32,
    pub channels: u16,
    pub canvas: FrameSize,
    /// Buffers allocated up front in each pool
    pub prealloc: usize,
    /// Capacity of one PCM block; bounds the audio a single mix may cover
    pub audio_capacity_frames: usize,
    /// Ticks per second of the audio recorder
    pub audio_sink_rate: u32,
    /// Concurrent renders per pattern source
    pub render_workers: usize,
    /// Concurrent jobs of the encoder
    pub encode_slots: usize,
    /// Lateness tolerated before a tick is skipped
    #[serde(with = "millis")]
    pub tick_slack: Duration,
    #[serde(with = "millis")]
    pub health_interval: Duration,
    #[serde(with = "millis")]
    pub duration: Duration,
    /// Delay before the second topology is queued; none keeps the first one
    pub switch_after_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_rate: assets::VIDEO_RATE,
            audio_rate: assets::AUDIO_RATE,
            channels: assets::AUDIO_CHANNELS,
            canvas: assets::CANVAS,
            prealloc: assets::POOL_PREALLOC,
            audio_capacity_frames: assets::AUDIO_RATE as usize,
            audio_sink_rate: assets::AUDIO_SINK_RATE,
            render_workers: 2,
            encode_slots: 2,
            tick_slack: Duration::from_millis(assets::TICK_SLACK_MS),
            health_interval: Duration::from_secs(5),
            duration: Duration::from_secs(10),
            switch_after_ms: Some(4_000),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.video_rate.is_valid() {
            bail!("invalid video rate {}", self.video_rate);
        }
        if self.audio_rate == 0 || self.audio_sink_rate == 0 {
            bail!("audio and sink rates must be positive");
        }
        if self.channels == 0 {
            bail!("at least one audio channel is required");
        }
        if self.canvas.pixels() == 0 {
            bail!("empty canvas {}x{}", self.canvas.width, self.canvas.height);
        }
        if self.audio_capacity_frames < self.audio_rate as usize {
            bail!(
                "audio blocks of {} frames cannot hold one second at {} Hz",
                self.audio_capacity_frames,
                self.audio_rate
            );
        }
        if self.render_workers == 0 || self.encode_slots == 0 {
            bail!("worker counts must be positive");
        }
        Ok(())
    }

    pub fn switch_after(&self) -> Option<Duration> {
        self.switch_after_ms.map(Duration::from_millis)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
