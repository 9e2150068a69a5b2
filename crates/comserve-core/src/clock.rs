//! Time sources for frame timestamps and send rate limiting.
//!
//! Timestamps are `f64` seconds since the Unix epoch. The system clock is
//! anchored to the wall clock once and then advanced with a monotonic
//! [`Instant`], so it never runs backwards while the process is alive.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of timestamps in seconds
pub trait Clock: Send + Sync {
    /// Current time in seconds
    fn now(&self) -> f64;
}

/// Wall-clock anchored, monotonic clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_wall: f64,
    anchor: Instant,
}

impl SystemClock {
    /// Create a clock anchored at the current wall time
    pub fn new() -> Self {
        let wall = Utc::now();
        Self {
            anchor_wall: wall.timestamp_micros() as f64 / 1_000_000.0,
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.anchor_wall + self.anchor.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock for deterministic tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock starting at `start` seconds
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = secs;
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += by.as_secs_f64();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a timestamp in seconds to a UTC date-time, if representable
pub fn to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}
