//! Progress reporting

use std::collections::VecDeque;

use serde::Serialize;

/// Lifecycle of a session as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Paused,
    Complete,
}

/// Snapshot answered by `TorrentSession::status`
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub name: String,
    pub state: SessionState,
    /// 0.0 to 100.0
    pub percent: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub total: u64,
    /// Bytes per second, averaged over the last samples
    pub speed: f64,
    pub peers: usize,
    pub completed_pieces: usize,
    pub total_pieces: usize,
}

/// Rolling average of per-tick download deltas
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    samples: VecDeque<u64>,
    window: usize,
    last_total: u64,
}

impl SpeedMeter {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
            last_total: 0,
        }
    }

    /// Feed the running byte total once per second
    pub fn sample(&mut self, total: u64) {
        let delta = total.saturating_sub(self.last_total);
        self.last_total = total;
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
    }

    /// Restart from `total` without counting it as a burst
    pub fn reset(&mut self, total: u64) {
        self.samples.clear();
        self.last_total = total;
    }

    pub fn bytes_per_sec(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_meter_window() {
        let mut meter = SpeedMeter::new(3);
        assert_eq!(meter.bytes_per_sec(), 0.0);

        meter.sample(100);
        meter.sample(300);
        assert_eq!(meter.bytes_per_sec(), 150.0);

        meter.sample(300);
        meter.sample(600);
        // window holds 200, 0, 300
        assert_eq!(meter.bytes_per_sec(), 500.0 / 3.0);
    }

    #[test]
    fn test_speed_meter_reset() {
        let mut meter = SpeedMeter::default();
        meter.sample(1000);
        meter.reset(5000);
        meter.sample(5100);
        assert_eq!(meter.bytes_per_sec(), 100.0);
    }

    #[test]
    fn test_status_serializes() {
        let status = TorrentStatus {
            name: "x".to_string(),
            state: SessionState::Paused,
            percent: 50.0,
            downloaded: 1,
            uploaded: 0,
            total: 2,
            speed: 0.0,
            peers: 0,
            completed_pieces: 1,
            total_pieces: 2,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "paused");
        assert_eq!(json["total_pieces"], 2);
    }
}
