use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use castify_core::assets;
use castify_core::capture::{PatternComponent, ToneComponent, ToneSpec};
use castify_core::clock::{PresentationClock, SystemTimeSource, TimeSource};
use castify_core::config::{PipelineConfig, app_name, version};
use castify_core::mixer::{Affine2x3, AudioMixKernel, MixerEngine, MixerStream, VideoMixKernel};
use castify_core::pipeline::{FrameRate, HealthMonitor, Session, Supervisor, Topology, TopologyBuilder};
use castify_core::pool::{BufferPool, FrameSize, PcmBlock, PcmShape, Poolable, RgbaFrame};
use castify_core::work::{AsyncWork, CaptureRuntime, TokioWork, WorkContext};
use castify_core::workers::{EncoderComponent, RecorderComponent, RleEncoder};
use clap::{Arg, Command, value_parser};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Components and pools shared by every topology version
struct Parts {
    video_rate: FrameRate,
    audio_rate: FrameRate,
    canvas: FrameSize,
    tone_low: Arc<ToneComponent>,
    tone_high: Arc<ToneComponent>,
    bars: Arc<PatternComponent>,
    overlay: Arc<PatternComponent>,
    encoder: Arc<EncoderComponent>,
    audio_recorder: Arc<RecorderComponent>,
    video_recorder: Arc<RecorderComponent>,
    tone_pool: BufferPool<PcmBlock>,
    mix_pool: BufferPool<PcmBlock>,
    pattern_pool: BufferPool<RgbaFrame>,
    canvas_pool: BufferPool<RgbaFrame>,
    /// Mixers of the latest topology; the next version continues them
    audio_mixer: Option<Arc<MixerStream<AudioMixKernel>>>,
    video_mixer: Option<Arc<MixerStream<VideoMixKernel>>>,
}

impl Parts {
    fn new(config: &PipelineConfig, work: &Arc<dyn AsyncWork>) -> Self {
        let audio_rate = FrameRate::per_second(config.audio_rate);
        let pcm = PcmShape {
            channels: config.channels,
            capacity_frames: config.audio_capacity_frames,
        };
        let tone_pool = BufferPool::with_capacity("tone", pcm, config.prealloc);
        let mix_pool = BufferPool::with_capacity("audio-mix", pcm, config.prealloc);
        let pattern_pool = BufferPool::with_capacity("pattern", config.canvas, config.prealloc);
        let canvas_pool = BufferPool::with_capacity("canvas", config.canvas, config.prealloc);

        let tone = |name: &str, frequency: f32| {
            let spec = ToneSpec {
                frequency,
                ..Default::default()
            };
            ToneComponent::new(name, audio_rate, spec, tone_pool.clone())
        };
        let pattern = |name: &str, alpha: u8| {
            Arc::new(
                PatternComponent::new(name, config.video_rate, pattern_pool.clone(), Arc::clone(work))
                    .with_workers(config.render_workers)
                    .with_alpha(alpha),
            )
        };
        let recorder = |name: &str, rate: FrameRate| {
            Arc::new(RecorderComponent::new(name, rate).with_slack(config.tick_slack))
        };

        let tone_low = tone("tone-440", 440.0);
        let tone_high = tone("tone-660", 660.0);
        let bars = pattern("bars", 255);
        let overlay = pattern("overlay", 192);
        let audio_recorder = recorder("audio-out", FrameRate::per_second(config.audio_sink_rate));
        let video_recorder = recorder("video-out", config.video_rate);

        Self {
            video_rate: config.video_rate,
            audio_rate,
            canvas: config.canvas,
            tone_low,
            tone_high,
            bars,
            overlay,
            encoder: EncoderComponent::new(
                "rle",
                Box::new(RleEncoder::new()),
                Arc::clone(work),
                config.encode_slots,
            ),
            audio_recorder,
            video_recorder,
            tone_pool,
            mix_pool,
            pattern_pool,
            canvas_pool,
            audio_mixer: None,
            video_mixer: None,
        }
    }

    /// Tones into an audio mixer, bars (plus an overlay) into a video mixer
    /// and the encoder; each branch ends in a recorder
    fn topology(&mut self, clock: Arc<PresentationClock>, with_overlay: bool) -> Result<Topology> {
        let mut builder = TopologyBuilder::new(clock);

        let low = builder.instantiate(self.tone_low.clone())?;
        let high = builder.instantiate(self.tone_high.clone())?;
        let engine = MixerEngine::new(AudioMixKernel::new(self.mix_pool.clone()), self.audio_rate, 2);
        let (mixer, inlets) = MixerStream::new("audio-mix", engine);
        if let Some(previous) = self.audio_mixer.replace(Arc::clone(&mixer)) {
            mixer.continue_from(&previous);
        }
        let audio_mix = MixerStream::wire(&mut builder, mixer, inlets, &[low, high])?;
        let audio_out = builder.instantiate(self.audio_recorder.clone())?;
        builder.connect(audio_mix, audio_out)?;

        let mut sources = vec![builder.instantiate(self.bars.clone())?];
        if with_overlay {
            sources.push(builder.instantiate(self.overlay.clone())?);
        }
        let kernel = VideoMixKernel::new(self.canvas_pool.clone(), sources.len())
            .with_background(assets::BACKGROUND);
        if let Some(transform) = kernel.transform(1) {
            let (w, h) = (self.canvas.width as f32, self.canvas.height as f32);
            let placed = Affine2x3::scale(0.5, 0.5).then(&Affine2x3::translate(w * 0.45, h * 0.45));
            transform.store(Arc::new(placed));
        }
        let engine = MixerEngine::new(kernel, self.video_rate, sources.len());
        let (mixer, inlets) = MixerStream::new("video-mix", engine);
        if let Some(previous) = self.video_mixer.replace(Arc::clone(&mixer)) {
            mixer.continue_from(&previous);
        }
        let video_mix = MixerStream::wire(&mut builder, mixer, inlets, &sources)?;
        let encode = builder.instantiate(self.encoder.clone())?;
        builder.connect(video_mix, encode)?;
        let video_out = builder.instantiate(self.video_recorder.clone())?;
        builder.connect(encode, video_out)?;

        Ok(builder.build())
    }

    fn dispose(&self) {
        dispose_pool(&self.tone_pool);
        dispose_pool(&self.mix_pool);
        dispose_pool(&self.pattern_pool);
        dispose_pool(&self.canvas_pool);
    }
}

fn dispose_pool<T: Poolable>(pool: &BufferPool<T>) {
    match pool.dispose() {
        Ok(()) => debug!("Pool '{}' disposed after {} allocations", pool.name(), pool.allocations()),
        Err(e) => warn!("{}", e),
    }
}

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON pipeline configuration.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("switch-after")
                .long("switch-after")
                .value_name("MS")
                .help("Queue the overlay topology after this many milliseconds (0 disables).")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Video frame rate.")
                .value_parser(value_parser!(u32)),
        )
}

fn load_config() -> Result<PipelineConfig> {
    let matches = cli().get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(&seconds) = matches.get_one::<u64>("duration") {
        config.duration = Duration::from_secs(seconds);
    }
    if let Some(&ms) = matches.get_one::<u64>("switch-after") {
        config.switch_after_ms = (ms > 0).then_some(ms);
    }
    if let Some(&fps) = matches.get_one::<u32>("fps") {
        config.video_rate = FrameRate::per_second(fps);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    info!("{} {} starting: {:?}", app_name(), version(), config);

    // Ctrl-C stops with a drain; it does not cancel scheduled work
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.cancel()).context("installing Ctrl-C handler")?;
    }

    let root = CancellationToken::new();
    let (supervisor, context) = Supervisor::new(root.clone());
    let supervisor = tokio::spawn(supervisor.run());

    // clock callbacks get their own workers, clear of mixing and encoding
    let capture = CaptureRuntime::new(assets::CAPTURE_THREADS).context("building the capture runtime")?;
    let work: Arc<dyn AsyncWork> = TokioWork::with_capture(&capture, root.clone());
    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let mut parts = Parts::new(&config, &work);
    let clock = |context: &WorkContext| PresentationClock::new(Arc::clone(&time), Arc::clone(&work), context.clone());

    let session = Session::new(context.clone());
    session.install(parts.topology(clock(&context), false)?)?;
    session.start(time.get_current_time())?;

    let monitor_stop = CancellationToken::new();
    let (alert_tx, mut alerts) = mpsc::channel(16);
    let monitor = HealthMonitor::new(Arc::clone(session.health()), alert_tx)
        .with_check_interval(config.health_interval);
    let monitor = {
        let stop = monitor_stop.clone();
        tokio::spawn(async move { monitor.run(stop).await })
    };

    let deadline = tokio::time::sleep(config.duration);
    tokio::pin!(deadline);
    let switch_after = config.switch_after();
    let switch = async move {
        match switch_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(switch);
    let mut switched = false;

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "interrupted",
            _ = root.cancelled() => break "torn down",
            _ = &mut deadline => break "duration elapsed",
            _ = &mut switch, if !switched => {
                switched = true;
                let next = parts.topology(clock(&context), true)?;
                info!("Queueing overlay topology {}", next.id());
                session.queue_switch(Arc::new(next));
            }
            Some(alert) = alerts.recv() => debug!("Health alert: {}", alert),
        }
    };

    info!("Stopping ({})", reason);
    session.stop(time.get_current_time())?;
    // drain packets answered on workers still have to reach the recorders
    tokio::time::sleep(config.video_rate.frame_duration() * 2).await;

    monitor_stop.cancel();
    monitor.await?;
    root.cancel();
    let fault = supervisor.await?;

    info!("{}", session.health().summary());
    info!("audio-out: {}", parts.audio_recorder.stats());
    info!("video-out: {}", parts.video_recorder.stats());
    info!("encoder dropped {} frames", parts.encoder.gate().dropped());

    drop(session);
    parts.audio_mixer = None;
    parts.video_mixer = None;
    parts.dispose();

    if let Some(report) = fault {
        bail!("pipeline torn down by {}: {}", report.origin, report.error);
    }
    Ok(())
}
