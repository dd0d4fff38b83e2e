use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window transfer rate over `(timestamp, cumulative bytes)` samples.
#[derive(Debug)]
pub struct ThroughputEstimator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Add a sample and evict any older than the window.
    pub fn record(&mut self, at: Instant, cumulative_bytes: u64) {
        self.samples.push_back((at, cumulative_bytes));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rate between the oldest and newest retained samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first_at, first_bytes)), Some(&(last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed > 0.0 {
            last_bytes.saturating_sub(first_bytes) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Average rate since a fixed start, for the BLE path.
pub fn running_rate(started: Instant, now: Instant, bytes: u64) -> f64 {
    let elapsed = now.duration_since(started).as_secs_f64();
    if elapsed > 0.0 {
        bytes as f64 / elapsed
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_uses_window_endpoints() {
        let start = Instant::now();
        let mut estimator = ThroughputEstimator::new(Duration::from_secs(3));
        assert_eq!(estimator.bytes_per_second(), 0.0);

        estimator.record(start, 0);
        estimator.record(start + Duration::from_secs(1), 1_000);
        estimator.record(start + Duration::from_secs(2), 5_000);
        assert_eq!(estimator.bytes_per_second(), 2_500.0);
    }

    #[test]
    fn test_old_samples_evicted() {
        let start = Instant::now();
        let mut estimator = ThroughputEstimator::new(Duration::from_secs(3));

        estimator.record(start, 0);
        estimator.record(start + Duration::from_secs(1), 100_000);
        estimator.record(start + Duration::from_secs(5), 104_000);
        estimator.record(start + Duration::from_secs(6), 106_000);

        // Only the samples at 5s and 6s survive.
        assert_eq!(estimator.bytes_per_second(), 2_000.0);

        estimator.reset();
        assert_eq!(estimator.bytes_per_second(), 0.0);
    }

    #[test]
    fn test_running_rate() {
        let start = Instant::now();
        assert_eq!(running_rate(start, start, 500), 0.0);
        assert_eq!(running_rate(start, start + Duration::from_secs(2), 500), 250.0);
    }
}
