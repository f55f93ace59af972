//! Throughput metrics.
//!
//! `RateTracker` keeps an exponential moving average of frames per second from
//! wall-clock deltas between consecutive frames. It is sampled on every frame,
//! inferred or reused.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Weight given to the previous smoothed value.
pub const SMOOTHING_ALPHA: f64 = 0.9;

/// Weight given to the newest sample. Equal to `1 - SMOOTHING_ALPHA`, spelled out
/// so the product is exact.
const SAMPLE_WEIGHT: f64 = 0.1;

/// Smoothed frames-per-second tracker.
#[derive(Clone, Debug, Default)]
pub struct RateTracker {
    smoothed_rate: f64,
    last_sample_time: Option<Instant>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame completion at `now` and return the smoothed rate.
    ///
    /// The first sample only records the time. Samples whose elapsed time is not
    /// strictly positive leave the rate untouched.
    pub fn sample(&mut self, now: Instant) -> f64 {
        let Some(last) = self.last_sample_time.replace(now) else {
            return self.smoothed_rate;
        };
        let elapsed = match now.checked_duration_since(last) {
            Some(elapsed) if !elapsed.is_zero() => elapsed.as_secs_f64(),
            _ => return self.smoothed_rate,
        };
        let instant_rate = 1.0 / elapsed;
        self.smoothed_rate = self.smoothed_rate * SMOOTHING_ALPHA + instant_rate * SAMPLE_WEIGHT;
        self.smoothed_rate
    }

    pub fn smoothed_rate(&self) -> f64 {
        self.smoothed_rate
    }

    pub fn last_sample_time(&self) -> Option<Instant> {
        self.last_sample_time
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// -------------------- Clocks --------------------

/// Source of "now" for the pipeline.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: Instant) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clock that advances by a fixed step each time it is read.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<Instant>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            next: Mutex::new(Instant::now()),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let now = *next;
        *next += self.step;
        now
    }
}
