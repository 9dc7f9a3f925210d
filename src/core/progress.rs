//! Throughput estimation for long-running file writers.
//!
//! While ffmpeg (or a byte copy) writes an artifact, a poller samples the
//! output's size at a fixed interval and logs progress. Sampling stops when
//! its token is cancelled, either because the writer finished or because the
//! process is being interrupted.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::logging::LogThrottle;

/// Last observation of a growing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrowthSample {
    pub bytes: u64,
    pub bytes_per_sec: u64,
    /// `None` when the final size is unknown.
    pub percentage: Option<u8>,
}

pub fn percentage(bytes: u64, expected: u64) -> Option<u8> {
    if expected == 0 {
        return None;
    }
    Some(((bytes.saturating_mul(100)) / expected).min(100) as u8)
}

pub struct GrowthPoller {
    path: PathBuf,
    expected: u64,
    interval: Duration,
    label: String,
}

impl GrowthPoller {
    pub fn new(path: impl Into<PathBuf>, expected: u64, interval: Duration) -> Self {
        Self {
            path: path.into(),
            expected,
            interval: interval.max(Duration::from_millis(10)),
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn sample(&self, started: Instant) -> GrowthSample {
        let bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let elapsed = started.elapsed().as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            (bytes as f64 / elapsed) as u64
        } else {
            0
        };
        GrowthSample {
            bytes,
            bytes_per_sec,
            percentage: percentage(bytes, self.expected),
        }
    }

    /// Sample until `stop` fires; returns the final sample.
    pub async fn run(self, stop: CancellationToken) -> GrowthSample {
        let started = Instant::now();
        let throttle = LogThrottle::new(Duration::from_secs(5).max(self.interval));
        let mut last = GrowthSample::default();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            last = self.sample(started);
            if throttle.should_log() {
                info!(
                    artifact = %self.label,
                    bytes = last.bytes,
                    expected = self.expected,
                    percentage = ?last.percentage,
                    bytes_per_sec = last.bytes_per_sec,
                    "Concatenation progress"
                );
            }
        }

        let last = if last.bytes == 0 { self.sample(started) } else { last };
        debug!(artifact = %self.label, bytes = last.bytes, "Stopped sampling");
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn percentage_is_clamped() {
        assert_eq!(percentage(50, 200), Some(25));
        assert_eq!(percentage(300, 200), Some(100));
        assert_eq!(percentage(10, 0), None);
    }

    #[tokio::test]
    async fn poller_observes_growth_until_stopped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        let stop = CancellationToken::new();
        let poller = GrowthPoller::new(&path, 200, Duration::from_millis(10)).with_label("qlog");
        let handle = tokio::spawn(poller.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        let sample = handle.await.unwrap();

        assert_eq!(sample.bytes, 100);
        assert_eq!(sample.percentage, Some(50));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let temp = tempdir().unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let sample = GrowthPoller::new(temp.path().join("none"), 0, Duration::from_millis(10))
            .run(stop)
            .await;
        assert_eq!(sample.bytes, 0);
        assert_eq!(sample.percentage, None);
    }
}
