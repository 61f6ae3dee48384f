//! Broker metrics and the scoring policy
//!
//! Scoring is a pure function of the three metrics and a weight profile.
//! Each metric is normalised against a fixed baseline to a 0.0-1.0 range;
//! an unmeasured metric (zero) contributes nothing.

use super::weights::ScoreWeights;
use serde::Serialize;
use std::time::Instant;

/// Round-trip latency at which the latency score reaches zero
pub const LATENCY_BASELINE_MS: f64 = 100.0;
/// Throughput at which the bandwidth score saturates
pub const BANDWIDTH_BASELINE_BPS: f64 = 1_000_000.0;
/// Connection count at which the connection score reaches zero
pub const CONNECTION_BASELINE: f64 = 100.0;

/// Live state of one known broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerRecord {
    pub uri: String,
    /// Round-trip latency in milliseconds, 0 when unmeasured
    pub latency: f64,
    /// Throughput in bytes per second, 0 when unmeasured
    pub bandwidth: f64,
    pub connection_count: u32,
    pub score: f64,
    pub available: bool,
    #[serde(skip)]
    pub last_check: Instant,
}

impl BrokerRecord {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            latency: 0.0,
            bandwidth: 0.0,
            connection_count: 0,
            score: 0.0,
            available: true,
            last_check: Instant::now(),
        }
    }

    /// Recompute `score` from the stored metrics
    pub fn recompute_score(&mut self, weights: &ScoreWeights) {
        self.score = if self.available {
            compute_score(self.latency, self.bandwidth, self.connection_count, weights)
        } else {
            0.0
        };
    }
}

pub fn latency_score(latency_ms: f64) -> f64 {
    if latency_ms > 0.0 {
        (1.0 - latency_ms / LATENCY_BASELINE_MS).max(0.0)
    } else {
        0.0
    }
}

pub fn bandwidth_score(bytes_per_sec: f64) -> f64 {
    if bytes_per_sec > 0.0 {
        (bytes_per_sec / BANDWIDTH_BASELINE_BPS).min(1.0)
    } else {
        0.0
    }
}

pub fn connection_score(connection_count: u32) -> f64 {
    if connection_count > 0 {
        (1.0 - f64::from(connection_count) / CONNECTION_BASELINE).max(0.0)
    } else {
        0.0
    }
}

/// Weighted score of a broker's metrics (availability is applied by the caller)
pub fn compute_score(
    latency_ms: f64,
    bandwidth_bps: f64,
    connection_count: u32,
    weights: &ScoreWeights,
) -> f64 {
    weights.latency * latency_score(latency_ms)
        + weights.bandwidth * bandwidth_score(bandwidth_bps)
        + weights.connection * connection_score(connection_count)
}
