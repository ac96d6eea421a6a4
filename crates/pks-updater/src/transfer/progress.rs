//! Download telemetry: rate-limited progress emission and sliding-window speed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Samples older than this no longer contribute to the speed estimate.
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Download progress information for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Transfer identifier
    pub id: String,
    /// Percentage complete (0.0 to 100.0), 0 while the size is unknown
    pub progress: f64,
    /// Bytes on disk, including any resumed prefix
    pub downloaded_bytes: u64,
    /// Total size, 0 if unknown
    pub total_bytes: u64,
    /// Bytes per second over the recent window
    pub speed: f64,
    /// Seconds remaining, `None` while speed or size is unknown
    pub eta: Option<f64>,
}

impl DownloadProgress {
    /// Check if the download is complete.
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }

    /// Get remaining bytes to download.
    pub fn remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.downloaded_bytes)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({:.1}%, {:.0} B/s)",
            self.downloaded_bytes, self.total_bytes, self.progress, self.speed
        )
    }
}

/// Percentage of `downloaded` over `total`, 0 when the total is unknown.
pub fn percentage(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// Decides when a progress event is worth emitting.
///
/// An event passes when the interval has elapsed since the last one or the
/// whole-number percentage has advanced.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u64>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    /// Record and report whether an update at `now` with `percent` should be emitted.
    pub fn should_emit(&mut self, now: Instant, percent: f64) -> bool {
        let whole = percent.max(0.0).floor() as u64;
        let due = match (self.last_emit, self.last_percent) {
            (None, _) | (_, None) => true,
            (Some(last), Some(last_percent)) => {
                now.saturating_duration_since(last) >= self.interval || whole > last_percent
            }
        };
        if due {
            self.last_emit = Some(now);
            self.last_percent = Some(whole);
        }
        due
    }
}

/// Transfer speed over a short sliding window.
#[derive(Debug, Default)]
pub struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample of cumulative bytes at `now` and drop expired ones.
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _)) if now.saturating_duration_since(*t) > SPEED_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second across the window, 0 without enough data.
    pub fn speed(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((t0, b0)), Some((t1, b1))) => {
                let elapsed = t1.saturating_duration_since(*t0).as_secs_f64();
                if elapsed > 0.0 {
                    b1.saturating_sub(*b0) as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

/// Seconds until `remaining` bytes arrive at `speed`, `None` when speed is zero.
pub fn eta_seconds(remaining: u64, speed: f64) -> Option<f64> {
    if speed > 0.0 {
        Some(remaining as f64 / speed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(300, 200), 100.0);
    }

    #[test]
    fn test_throttle_time_based() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));

        assert!(throttle.should_emit(start, 0.0));
        assert!(!throttle.should_emit(start + Duration::from_millis(50), 0.2));
        assert!(throttle.should_emit(start + Duration::from_millis(100), 0.4));
        assert!(!throttle.should_emit(start + Duration::from_millis(150), 0.6));
    }

    #[test]
    fn test_throttle_percentage_based() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_secs(10));

        assert!(throttle.should_emit(start, 10.2));
        assert!(!throttle.should_emit(start, 10.9));
        assert!(throttle.should_emit(start, 11.0));
        assert!(throttle.should_emit(start, 100.0));
        assert!(!throttle.should_emit(start, 100.0));
    }

    #[test]
    fn test_speed_window() {
        let start = Instant::now();
        let mut window = SpeedWindow::new();
        assert_eq!(window.speed(), 0.0);

        window.record(start, 0);
        assert_eq!(window.speed(), 0.0);

        window.record(start + Duration::from_secs(1), 1000);
        window.record(start + Duration::from_secs(2), 3000);
        assert!((window.speed() - 1500.0).abs() < 1e-6);

        // Samples older than the window are dropped
        window.record(start + Duration::from_secs(5), 6000);
        assert!((window.speed() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_seconds(1000, 0.0), None);
        assert_eq!(eta_seconds(1000, 250.0), Some(4.0));
    }

    #[test]
    fn test_progress_display() {
        let progress = DownloadProgress {
            id: "a".into(),
            progress: 50.0,
            downloaded_bytes: 512,
            total_bytes: 1024,
            speed: 128.0,
            eta: Some(4.0),
        };
        assert_eq!(progress.to_string(), "512/1024 bytes (50.0%, 128 B/s)");
        assert_eq!(progress.remaining(), 512);
        assert!(!progress.is_complete());
    }
}
