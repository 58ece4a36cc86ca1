//! Health counters for one clock domain

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Health metrics for a session
///
/// All fields use atomic operations; streams update them from any worker.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    /// Packets issued by sinks
    pub packets_issued: AtomicU64,

    /// Samples handed downstream by sources
    pub samples_delivered: AtomicU64,

    /// Units of work dropped for lack of capacity or lateness
    pub drops: AtomicU64,

    /// Samples delivered with the discontinuity flag
    pub discontinuities: AtomicU64,

    /// Fatal or contract errors surfaced to a session call
    pub fatal_errors: AtomicU64,

    /// Mixer inputs discarded for being older than the cutoff
    pub late_drops: AtomicU64,

    /// Topology switches performed
    pub switches: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        self.packets_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, discontinuity: bool) {
        self.samples_delivered.fetch_add(1, Ordering::Relaxed);
        if discontinuity {
            self.discontinuities.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.late_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_issued(&self) -> u64 {
        self.packets_issued.load(Ordering::Relaxed)
    }

    pub fn samples_delivered(&self) -> u64 {
        self.samples_delivered.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities.load(Ordering::Relaxed)
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops.load(Ordering::Relaxed)
    }

    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Drops as a percentage of issued packets
    pub fn drop_rate(&self) -> f64 {
        let drops = self.drops();
        let issued = self.packets_issued();
        if issued == 0 {
            return 0.0;
        }
        (drops as f64 / issued as f64) * 100.0
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_issued: self.packets_issued(),
            samples_delivered: self.samples_delivered(),
            drops: self.drops(),
            drop_rate: self.drop_rate(),
            discontinuities: self.discontinuities(),
            fatal_errors: self.fatal_errors(),
            late_drops: self.late_drops(),
            switches: self.switches(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub packets_issued: u64,
    pub samples_delivered: u64,
    pub drops: u64,
    pub drop_rate: f64,
    pub discontinuities: u64,
    pub fatal_errors: u64,
    pub late_drops: u64,
    pub switches: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} packets, {} samples ({} drops, {:.2}%), {} discontinuities, {} late, {} fatal, {} switches",
            self.packets_issued,
            self.samples_delivered,
            self.drops,
            self.drop_rate,
            self.discontinuities,
            self.late_drops,
            self.fatal_errors,
            self.switches
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// No packet was issued during a whole check interval
    Stalled { interval: Duration },

    /// Drop rate above the configured threshold
    HighDropRate { rate: f64 },

    /// New fatal errors since the last check
    FatalErrors { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { interval } => {
                write!(f, "No packets issued for {:?}", interval)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High drop rate: {:.2}%", rate)
            }
            HealthAlert::FatalErrors { count } => {
                write!(f, "Fatal errors: {}", count)
            }
        }
    }
}

/// Periodic health check
///
/// Logs a summary every interval and forwards alerts when issues appear.
pub struct HealthMonitor {
    health: Arc<PipelineHealth>,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new(health: Arc<PipelineHealth>, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            alert_tx,
            check_interval: Duration::from_secs(5),
            drop_rate_threshold: 10.0,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Inspect the counters once, given the values seen at the previous check
    fn check(&self, last_packets: u64, last_fatal: u64) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();
        if self.health.packets_issued() == last_packets {
            alerts.push(HealthAlert::Stalled {
                interval: self.check_interval,
            });
        }
        let rate = self.health.drop_rate();
        if rate > self.drop_rate_threshold {
            alerts.push(HealthAlert::HighDropRate { rate });
        }
        let fatal = self.health.fatal_errors();
        if fatal > last_fatal {
            alerts.push(HealthAlert::FatalErrors {
                count: fatal - last_fatal,
            });
        }
        alerts
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        // first tick completes immediately
        interval.tick().await;
        let mut last_packets = self.health.packets_issued();
        let mut last_fatal = self.health.fatal_errors();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            info!("{}", self.health.summary());
            for alert in self.check(last_packets, last_fatal) {
                warn!("{}", alert);
                let _ = self.alert_tx.send(alert).await;
            }
            last_packets = self.health.packets_issued();
            last_fatal = self.health.fatal_errors();
        }
    }
}
