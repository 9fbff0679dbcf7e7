//! Sliding-window throughput and ETA estimation.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent chunk samples the estimate is computed over. Keeping the
/// window small lets the estimate adapt to changing network conditions within
/// a handful of chunks.
pub const SPEED_WINDOW: usize = 5;

#[derive(Clone, Copy, Debug)]
struct Sample {
    bytes: u64,
    duration: Duration,
}

/// Throughput estimator fed one `(bytes, duration)` sample per acknowledged
/// chunk.
#[derive(Debug)]
pub struct SpeedEstimator {
    window: VecDeque<Sample>,
    capacity: usize,
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::with_window(SPEED_WINDOW)
    }
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be non-zero");
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, bytes: u64, duration: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(Sample { bytes, duration });
    }

    /// Bytes per second over the window. 0.0 when the window is empty or has
    /// accumulated no measurable time; never negative or NaN.
    pub fn speed(&self) -> f64 {
        let bytes: u64 = self.window.iter().map(|s| s.bytes).sum();
        let secs: f64 = self.window.iter().map(|s| s.duration.as_secs_f64()).sum();
        if secs > 0.0 {
            bytes as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated seconds to transfer `remaining` bytes, or `None` when the
    /// current speed gives no basis for an estimate.
    pub fn eta(&self, remaining: u64) -> Option<f64> {
        let speed = self.speed();
        (speed > 0.0).then(|| remaining as f64 / speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zero_speed_and_no_eta() {
        let estimator = SpeedEstimator::new();
        assert_eq!(estimator.speed(), 0.0);
        assert_eq!(estimator.eta(1000), None);
    }

    #[test]
    fn zero_duration_samples_do_not_divide_by_zero() {
        let mut estimator = SpeedEstimator::new();
        estimator.record(1024, Duration::ZERO);
        assert_eq!(estimator.speed(), 0.0);
        assert_eq!(estimator.eta(1024), None);
    }

    #[test]
    fn speed_is_window_average() {
        let mut estimator = SpeedEstimator::new();
        estimator.record(100, Duration::from_secs(1));
        estimator.record(300, Duration::from_secs(1));
        assert_eq!(estimator.speed(), 200.0);
        assert_eq!(estimator.eta(400), Some(2.0));
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut estimator = SpeedEstimator::with_window(5);
        for _ in 0..5 {
            estimator.record(10, Duration::from_secs(1));
        }
        assert_eq!(estimator.speed(), 10.0);
        // five fast chunks push every slow sample out
        for _ in 0..5 {
            estimator.record(1000, Duration::from_secs(1));
        }
        assert_eq!(estimator.speed(), 1000.0);
    }

    #[test]
    fn never_negative_or_nan() {
        let mut estimator = SpeedEstimator::new();
        estimator.record(0, Duration::ZERO);
        estimator.record(0, Duration::from_secs(1));
        let speed = estimator.speed();
        assert!(speed >= 0.0 && speed.is_finite());
        // zero speed means indeterminate, not infinite, ETA
        assert_eq!(estimator.eta(u64::MAX), None);
    }
}
