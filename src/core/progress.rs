//! Throughput estimation and human-readable formatting for live progress.

use std::time::{Duration, Instant};

/// Exponentially-weighted moving average of throughput.
///
/// Fed with cumulative byte counts; each observation contributes in
/// proportion to the time it covers relative to the smoothing window, so a
/// burst of closely-spaced dd status lines does not whipsaw the estimate.
#[derive(Debug)]
pub struct SpeedEstimator {
    window: Duration,
    last: Option<(Instant, u64)>,
    ema_bps: Option<f64>,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(2))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            last: None,
            ema_bps: None,
        }
    }

    /// Record the cumulative byte count as of now and return the smoothed
    /// throughput estimate, if one exists yet.
    pub fn observe(&mut self, total_bytes: u64) -> Option<f64> {
        self.observe_at(Instant::now(), total_bytes)
    }

    fn observe_at(&mut self, now: Instant, total_bytes: u64) -> Option<f64> {
        if let Some((prev_at, prev_bytes)) = self.last {
            let dt = now.saturating_duration_since(prev_at).as_secs_f64();
            if dt > 0.0 && total_bytes >= prev_bytes {
                let sample = (total_bytes - prev_bytes) as f64 / dt;
                let weight = (dt / self.window.as_secs_f64()).min(1.0);
                self.ema_bps = Some(match self.ema_bps {
                    Some(ema) => ema + (sample - ema) * weight,
                    None => sample,
                });
            }
        }
        self.last = Some((now, total_bytes));
        self.ema_bps
    }

    pub fn speed_bps(&self) -> Option<f64> {
        self.ema_bps
    }

    /// Seconds left for `remaining` bytes at the current estimate.
    pub fn eta_seconds(&self, remaining: u64) -> Option<f64> {
        match self.ema_bps {
            Some(bps) if bps > 0.0 => Some(remaining as f64 / bps),
            _ => None,
        }
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn human_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return if unit == "B" {
                format!("{} {}", bytes, unit)
            } else {
                format!("{:.1} {}", value, unit)
            };
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

pub fn human_speed(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{:.0} B/s", bps)
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else if bps < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bps / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB/s", bps / (1024.0 * 1024.0 * 1024.0))
    }
}

/// `m:ss` / `h:mm:ss`, or `--:--` when no estimate exists.
pub fn human_eta(eta_seconds: Option<f64>) -> String {
    match eta_seconds {
        Some(secs) if secs > 0.0 => {
            let total = secs as u64;
            let (h, rem) = (total / 3600, total % 3600);
            let (m, s) = (rem / 60, rem % 60);
            if h > 0 {
                format!("{}:{:02}:{:02}", h, m, s)
            } else {
                format!("{}:{:02}", m, s)
            }
        }
        _ => "--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_needs_two_observations() {
        let mut est = SpeedEstimator::new();
        assert!(est.observe_at(Instant::now(), 0).is_none());
    }

    #[test]
    fn estimator_converges_on_steady_rate() {
        let mut est = SpeedEstimator::new();
        let start = Instant::now();
        // 10 MB/s in 500 ms steps.
        for i in 0..10u64 {
            est.observe_at(start + Duration::from_millis(500 * i), i * 5_000_000);
        }
        let bps = est.speed_bps().unwrap();
        assert!((bps - 10_000_000.0).abs() < 500_000.0, "got {bps}");
    }

    #[test]
    fn estimator_smooths_a_spike() {
        let mut est = SpeedEstimator::new();
        let start = Instant::now();
        est.observe_at(start, 0);
        est.observe_at(start + Duration::from_secs(1), 10_000_000);
        // One wild 100 ms sample at 10x the rate moves the EMA only a little.
        est.observe_at(start + Duration::from_millis(1100), 20_000_000);
        let bps = est.speed_bps().unwrap();
        assert!(bps < 20_000_000.0, "got {bps}");
    }

    #[test]
    fn eta_from_rate() {
        let mut est = SpeedEstimator::new();
        let start = Instant::now();
        est.observe_at(start, 0);
        est.observe_at(start + Duration::from_secs(2), 2_000_000);
        let eta = est.eta_seconds(10_000_000).unwrap();
        assert!((eta - 10.0).abs() < 1.0, "got {eta}");
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(512 * 1024 * 1024), "512.0 MB");
        assert_eq!(human_size(16 * 1024 * 1024 * 1024), "16.0 GB");
    }

    #[test]
    fn human_speeds() {
        assert_eq!(human_speed(500.0), "500 B/s");
        assert_eq!(human_speed(10.5 * 1024.0 * 1024.0), "10.5 MB/s");
    }

    #[test]
    fn human_etas() {
        assert_eq!(human_eta(None), "--:--");
        assert_eq!(human_eta(Some(0.0)), "--:--");
        assert_eq!(human_eta(Some(75.0)), "1:15");
        assert_eq!(human_eta(Some(3725.0)), "1:02:05");
    }
}
