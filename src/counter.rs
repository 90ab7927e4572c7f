//! A small throughput counter used to track a peer's download/upload rate.
//!
//! The rate is a running average of the downloaded bytes per second, as
//! referenced in `peer.rs`'s `Status::best_request_queue_len` doc comment.
//! We use an exponential moving average over a ~10s window (spec.md §3),
//! rather than a plain sliding window, since it's cheap to update on every
//! block arrival without keeping a timestamped history.

use std::time::{Duration, Instant};

/// Smoothing factor for the EWMA. Larger values weigh recent samples more.
/// Chosen so that a full window of silence (10s) decays a steady rate to
/// under 1% of its original value.
const SMOOTHING: f64 = 0.3;

/// The window over which throughput is averaged.
const WINDOW: Duration = Duration::from_secs(10);

/// Tracks bytes transferred over time and exposes a smoothed rate.
#[derive(Debug, Clone)]
pub(crate) struct ThruputCounter {
    /// Total bytes seen since creation.
    total: u64,
    /// Bytes accumulated in the current second-sized bucket.
    bucket: u64,
    /// When the current bucket started.
    bucket_start: Instant,
    /// The current smoothed rate, in bytes/sec.
    rate: f64,
    /// The last time any bytes were recorded.
    last_update: Instant,
}

impl ThruputCounter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            total: 0,
            bucket: 0,
            bucket_start: now,
            rate: 0.0,
            last_update: now,
        }
    }

    /// Records `n` newly transferred bytes.
    pub fn update(&mut self, n: u32) {
        let now = Instant::now();
        self.total += n as u64;
        self.bucket += n as u64;
        self.last_update = now;

        let elapsed = now.saturating_duration_since(self.bucket_start);
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f64().max(1.0);
            let sample_rate = self.bucket as f64 / secs;
            self.rate = SMOOTHING * sample_rate + (1.0 - SMOOTHING) * self.rate;
            self.bucket = 0;
            self.bucket_start = now;
        }
    }

    /// Returns the current smoothed rate, in bytes/sec, decaying it to zero
    /// if no bytes have been recorded within the averaging window.
    pub fn rate(&self) -> u64 {
        if self.last_update.elapsed() > WINDOW {
            0
        } else {
            self.rate.round() as u64
        }
    }

    /// Returns the total number of bytes recorded over the counter's
    /// lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the time elapsed since the last recorded transfer, used for
    /// snub detection (spec.md §4.8).
    pub fn time_since_last_update(&self) -> Duration {
        self.last_update.elapsed()
    }
}

impl Default for ThruputCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_initial_rate() {
        let counter = ThruputCounter::new();
        assert_eq!(counter.rate(), 0);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_total_accumulates() {
        let mut counter = ThruputCounter::new();
        counter.update(100);
        counter.update(200);
        assert_eq!(counter.total(), 300);
    }
}
