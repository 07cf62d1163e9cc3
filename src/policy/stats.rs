//! Rolling-window numeric statistics over the most recent `WINDOW` samples
//! per series (§4.3 "Rolling statistics"). Percentiles interpolate linearly
//! between the two bracketing ranks, matching `_percentile()` in the
//! original policy engine.

use std::collections::VecDeque;

pub const ROLLING_WINDOW: usize = 40;
pub const HALLUCINATION_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct WindowSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self::with_capacity(ROLLING_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Linear-interpolation percentile, `p` in `[0.0, 1.0]`, between the two
    /// bracketing ranks.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        if sorted.len() == 1 {
            return sorted[0];
        }
        let k = p * (sorted.len() - 1) as f64;
        let lower = k.floor() as usize;
        let upper = (sorted.len() - 1).min(lower + 1);
        let weight = k - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }

    pub fn min(&self) -> f64 {
        self.samples
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn summary(&self) -> WindowSummary {
        if self.samples.is_empty() {
            return WindowSummary::default();
        }
        WindowSummary {
            count: self.samples.len(),
            mean: self.mean(),
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
            min: self.min(),
            max: self.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_last_40_of_60_sequential_values() {
        let mut w = RollingWindow::new();
        for seq in 1..=60 {
            w.push(seq as f64);
        }
        // last 40 values are 21..=60, mean is (21+60)/2 = 40.5
        assert_eq!(w.len(), 40);
        assert!((w.mean() - 40.5).abs() < 1e-9);
    }

    #[test]
    fn percentile_on_small_series() {
        let mut w = RollingWindow::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        assert_eq!(w.percentile(0.50), 3.0);
        assert_eq!(w.min(), 1.0);
        assert_eq!(w.max(), 5.0);
    }

    #[test]
    fn empty_window_reports_zeroes() {
        let w = RollingWindow::new();
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.percentile(0.90), 0.0);
    }

    #[test]
    fn with_capacity_evicts_at_custom_size() {
        let mut w = RollingWindow::with_capacity(HALLUCINATION_WINDOW);
        for v in 0..(HALLUCINATION_WINDOW + 5) {
            w.push(v as f64);
        }
        assert_eq!(w.len(), HALLUCINATION_WINDOW);
    }
}
