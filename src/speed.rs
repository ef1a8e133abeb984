//! Sliding-window speed tracker (spec §4.3): a mutex-guarded buffer of
//! `(timestamp, bytes)` samples spanning the last 3 seconds, shared by the
//! Transfer Engine (progress reporting) and the Adaptive Controller
//! (per-worker throughput comparisons).
//!
//! Grounded on the teacher crate's `scheduler::Scheduler` recent-throughput
//! deque and `SegmentStats::throughput`, narrowed into a standalone
//! per-job/per-worker primitive.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub const WINDOW: Duration = Duration::from_secs(3);

struct Sample {
    at: Instant,
    bytes: u64,
}

pub struct SpeedTracker {
    samples: Mutex<VecDeque<Sample>>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, bytes: u64) {
        let mut samples = self.samples.lock().await;
        let now = Instant::now();
        samples.push_back(Sample { at: now, bytes });
        prune(&mut samples, now);
    }

    /// `speed_bps = Σbytes / window_duration`, over the samples that fall
    /// within the trailing 3s window.
    pub async fn speed_bps(&self) -> f64 {
        let mut samples = self.samples.lock().await;
        let now = Instant::now();
        prune(&mut samples, now);
        if samples.is_empty() {
            return 0.0;
        }
        let total: u64 = samples.iter().map(|s| s.bytes).sum();
        total as f64 / WINDOW.as_secs_f64()
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant) {
    while let Some(front) = samples.front() {
        if now.duration_since(front.at) > WINDOW {
            samples.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_tracker_reports_zero_speed() {
        let tracker = SpeedTracker::new();
        assert_eq!(tracker.speed_bps().await, 0.0);
    }

    #[tokio::test]
    async fn recorded_bytes_contribute_to_speed() {
        let tracker = SpeedTracker::new();
        tracker.record(3_000_000).await;
        let speed = tracker.speed_bps().await;
        assert!(speed > 0.0);
        // 3,000,000 bytes over a 3s window is ~1,000,000 bytes/s.
        assert!((speed - 1_000_000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn stale_samples_are_pruned() {
        let tracker = SpeedTracker::new();
        tracker.record(1_000_000).await;
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tracker.speed_bps().await, 0.0);
    }
}
