//! Adaptive interval for the polling timer
//!
//! The next run is scheduled so that the work takes at most `fraction` of
//! wall time, but never sooner than `default_interval` and never later than
//! `max_interval` after the previous start.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Timeslice {
    fraction: f64,
    default_interval: Duration,
    max_interval: Duration,
    next_start: Instant,
}

impl Timeslice {
    pub fn new(fraction: f64, default_interval: Duration, max_interval: Duration) -> Self {
        Timeslice {
            fraction,
            default_interval,
            max_interval: max_interval.max(default_interval),
            next_start: Instant::now() + default_interval,
        }
    }

    pub fn next_start(&self) -> Instant {
        self.next_start
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_start
    }

    /// Schedule the next run from the start time and duration of this one
    pub fn record(&mut self, started: Instant, took: Duration) {
        self.next_start = started + self.interval_for(took);
    }

    fn interval_for(&self, took: Duration) -> Duration {
        let scaled = if self.fraction > 0.0 {
            Duration::from_secs_f64(took.as_secs_f64() / self.fraction)
        } else {
            self.max_interval
        };
        scaled.max(self.default_interval).min(self.max_interval)
    }
}
