//! Byte counters shared between a peer session and the torrent control loop,
//! and the rate estimation built on top of them.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// The window over which throughput is smoothed. The choker's view of a peer
/// reacts to rate changes on roughly this time scale.
const RATE_WINDOW: Duration = Duration::from_secs(20);

/// Monotonic byte counters updated by a peer session on its own task and read
/// by the torrent's control loop on choke rounds.
#[derive(Debug, Default)]
pub(crate) struct ThruputCounters {
    /// Payload (block) bytes received from the peer.
    pub down: Counter,
    /// Payload (block) bytes sent to the peer.
    pub up: Counter,
}

/// A monotonically increasing byte counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An exponential moving average over a monotonic byte counter, advanced at
/// whatever cadence the owner samples it (the choker samples on each round).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RateEstimator {
    prev_total: u64,
    /// Smoothed throughput in bytes per second.
    rate: f64,
}

impl RateEstimator {
    /// Folds the counter's current total into the average. `elapsed` is the
    /// time since the previous `update` call.
    pub fn update(&mut self, total: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.rate;
        }
        let delta = total.saturating_sub(self.prev_total);
        self.prev_total = total;
        let instant_rate = delta as f64 / secs;
        // the weight of one sample is its share of the smoothing window, so
        // a burst decays over ~RATE_WINDOW regardless of the sample cadence
        let alpha = (secs / RATE_WINDOW.as_secs_f64()).min(1.0);
        self.rate = alpha * instant_rate + (1.0 - alpha) * self.rate;
        self.rate
    }

    /// The most recently computed smoothed rate, in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let c = Counter::default();
        c.add(100);
        c.add(50);
        assert_eq!(c.total(), 150);
    }

    #[test]
    fn test_rate_estimator_converges_on_steady_load() {
        let mut est = RateEstimator::default();
        let mut total = 0;
        // 10 KiB/s sustained for two windows should converge near 10 KiB/s
        for _ in 0..40 {
            total += 10 * 1024;
            est.update(total, Duration::from_secs(1));
        }
        let rate = est.rate();
        assert!(rate > 8.0 * 1024.0 && rate <= 10.0 * 1024.0 + 1.0);
    }

    #[test]
    fn test_rate_estimator_decays_when_idle() {
        let mut est = RateEstimator::default();
        est.update(1_000_000, Duration::from_secs(1));
        let peak = est.rate();
        for _ in 0..40 {
            est.update(1_000_000, Duration::from_secs(1));
        }
        assert!(est.rate() < peak / 4.0);
    }

    #[test]
    fn test_rate_estimator_ignores_zero_elapsed() {
        let mut est = RateEstimator::default();
        est.update(1000, Duration::from_secs(1));
        let before = est.rate();
        est.update(2000, Duration::from_secs(0));
        assert_eq!(est.rate(), before);
    }
}
