use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::config::AbrConfig;

/// Requests shorter than this are measured as lasting this long.
const MIN_DURATION_MS: f64 = 0.5;

/// Measurement taken once a segment request completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestSample {
    pub bytes: u64,
    pub duration: Duration,
}

impl RequestSample {
    pub fn new(bytes: u64, duration: Duration) -> Self {
        Self { bytes, duration }
    }
}

/// Bandwidth estimation strategy.
#[cfg_attr(test, automock)]
pub trait Estimator: Send {
    fn add_sample(&mut self, sample: RequestSample);

    /// Estimated bandwidth in bits per second, `None` until enough data was sampled.
    fn estimate(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// Dual exponentially weighted moving average.
///
/// A fast and a slow average are kept and the lowest one is used, so that the estimate
/// drops quickly when the network degrades but recovers conservatively.
#[derive(Debug, Clone)]
pub struct EwmaEstimator {
    fast: Ewma,
    slow: Ewma,
    bytes_sampled: u64,
    min_total_bytes: u64,
    min_chunk_bytes: u64,
}

impl EwmaEstimator {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast: Ewma::new(config.fast_half_life_secs),
            slow: Ewma::new(config.slow_half_life_secs),
            bytes_sampled: 0,
            min_total_bytes: config.min_total_bytes,
            min_chunk_bytes: config.min_chunk_bytes,
        }
    }
}

impl Estimator for EwmaEstimator {
    fn add_sample(&mut self, sample: RequestSample) {
        if sample.bytes < self.min_chunk_bytes {
            return;
        }
        let dur_ms = (sample.duration.as_secs_f64() * 1000.0).max(MIN_DURATION_MS);
        let bps = sample.bytes as f64 * 8000.0 / dur_ms;
        let weight_secs = dur_ms / 1000.0;

        self.fast.add_sample(weight_secs, bps);
        self.slow.add_sample(weight_secs, bps);
        self.bytes_sampled = self.bytes_sampled.saturating_add(sample.bytes);
    }

    fn estimate(&self) -> Option<f64> {
        if self.bytes_sampled < self.min_total_bytes {
            return None;
        }
        let estimate = self.fast.estimate().min(self.slow.estimate());
        (estimate > 0.0).then_some(estimate)
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.bytes_sampled = 0;
    }
}

#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn add_sample(&mut self, weight: f64, val: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last_estimate = val * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight.max(0.0);
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
        self.last_estimate / zero_factor.max(1e-6)
    }

    fn reset(&mut self) {
        self.last_estimate = 0.0;
        self.total_weight = 0.0;
    }
}
