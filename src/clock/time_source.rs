//! Time sources the presentation clock rides on

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::pipeline::types::Timestamp;

/// Monotonic basis of a presentation clock
pub trait TimeSource: Send + Sync {
    fn get_current_time(&self) -> Timestamp;

    /// Re-base the source so that "now" reads as `t`
    fn set_current_time(&self, t: Timestamp);

    fn start(&self);

    /// Freeze the source at its current reading
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Map a system instant (device timestamp) onto clock time
    fn to_clock_time(&self, instant: Instant) -> Timestamp;

    /// Real time left until the clock reads `due`
    fn delay_until(&self, due: Timestamp) -> Duration {
        due.saturating_since(self.get_current_time())
    }
}

struct Anchor {
    /// System instant at which the clock read `time`
    instant: Instant,
    time: Timestamp,
    running: bool,
}

/// Time source backed by the system monotonic clock
///
/// The source keeps one anchor `(instant, time)`; the current reading is
/// `time + instant.elapsed()` while running and `time` while stopped.
pub struct SystemTimeSource {
    anchor: Mutex<Anchor>,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::with_base(Instant::now())
    }

    /// Source reading zero at `base`
    pub fn with_base(base: Instant) -> Self {
        Self {
            anchor: Mutex::new(Anchor {
                instant: base,
                time: Timestamp::ZERO,
                running: false,
            }),
        }
    }

    fn reading(anchor: &Anchor, at: Instant) -> Timestamp {
        if !anchor.running {
            return anchor.time;
        }
        match at.checked_duration_since(anchor.instant) {
            Some(elapsed) => anchor.time.add(elapsed),
            None => anchor.time.sub(anchor.instant.duration_since(at)),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn get_current_time(&self) -> Timestamp {
        let anchor = self.anchor.lock();
        Self::reading(&anchor, Instant::now())
    }

    fn set_current_time(&self, t: Timestamp) {
        let mut anchor = self.anchor.lock();
        anchor.instant = Instant::now();
        anchor.time = t;
    }

    fn start(&self) {
        let mut anchor = self.anchor.lock();
        if !anchor.running {
            anchor.instant = Instant::now();
            anchor.running = true;
        }
    }

    fn stop(&self) {
        let mut anchor = self.anchor.lock();
        if anchor.running {
            let now = Instant::now();
            anchor.time = Self::reading(&anchor, now);
            anchor.instant = now;
            anchor.running = false;
        }
    }

    fn is_running(&self) -> bool {
        self.anchor.lock().running
    }

    fn to_clock_time(&self, instant: Instant) -> Timestamp {
        let anchor = self.anchor.lock();
        let mut running = Anchor { ..*anchor };
        // device timestamps map onto the running timeline even while frozen
        running.running = true;
        Self::reading(&running, instant)
    }
}

/// Hand-driven time source for tests and offline rendering
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    micros: AtomicI64,
    running: AtomicBool,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        let micros = by.as_micros() as i64;
        Timestamp::from_micros(self.micros.fetch_add(micros, Ordering::AcqRel) + micros)
    }
}

impl TimeSource for ManualTimeSource {
    fn get_current_time(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::Acquire))
    }

    fn set_current_time(&self, t: Timestamp) {
        self.micros.store(t.micros, Ordering::Release);
    }

    fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn to_clock_time(&self, _instant: Instant) -> Timestamp {
        self.get_current_time()
    }
}
