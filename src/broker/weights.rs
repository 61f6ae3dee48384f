//! Category weight profiles for broker scoring
//!
//! Each device category weighs latency, bandwidth and connection load
//! differently. The table is an immutable value injected into the registry at
//! construction, so tests and deployments can supply their own profiles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category used when a requested category has no profile
pub const DEFAULT_CATEGORY: &str = "sensor";

/// Tolerance applied when checking that weights sum to 1.0
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Relative importance of each broker metric, summing to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub latency: f64,
    pub bandwidth: f64,
    pub connection: f64,
}

impl ScoreWeights {
    pub const fn new(latency: f64, bandwidth: f64, connection: f64) -> Self {
        Self {
            latency,
            bandwidth,
            connection,
        }
    }

    /// Check the weights are non-negative and sum to 1.0
    pub fn validate(&self) -> Result<(), String> {
        let parts = [
            ("latency", self.latency),
            ("bandwidth", self.bandwidth),
            ("connection", self.connection),
        ];
        for (name, value) in parts {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} weight must be a non-negative number, got {value}"));
            }
        }

        let sum = self.latency + self.bandwidth + self.connection;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(format!("weights must sum to 1.0, got {sum}"));
        }
        Ok(())
    }
}

const BUILTIN_PROFILES: [(&str, ScoreWeights); 11] = [
    ("sensor", ScoreWeights::new(0.6, 0.2, 0.2)),
    ("camera", ScoreWeights::new(0.2, 0.6, 0.2)),
    ("meter", ScoreWeights::new(0.6, 0.2, 0.2)),
    ("light", ScoreWeights::new(0.6, 0.2, 0.2)),
    ("appliance", ScoreWeights::new(0.6, 0.2, 0.2)),
    ("wearable", ScoreWeights::new(0.3, 0.4, 0.3)),
    ("beacon", ScoreWeights::new(0.6, 0.2, 0.2)),
    ("traffic", ScoreWeights::new(0.4, 0.2, 0.4)),
    ("drone", ScoreWeights::new(0.3, 0.5, 0.2)),
    ("rfid", ScoreWeights::new(0.3, 0.2, 0.5)),
    ("signage", ScoreWeights::new(0.2, 0.6, 0.2)),
];

/// Mapping from category name to weight profile
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    profiles: HashMap<String, ScoreWeights>,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl WeightTable {
    /// The standard device-category table
    pub fn builtin() -> Self {
        let profiles = BUILTIN_PROFILES
            .iter()
            .map(|(name, weights)| (name.to_string(), *weights))
            .collect();
        Self { profiles }
    }

    /// Add or replace a profile, returning the extended table
    pub fn with_profile(mut self, category: impl Into<String>, weights: ScoreWeights) -> Self {
        self.profiles.insert(category.into(), weights);
        self
    }

    pub fn get(&self, category: &str) -> Option<ScoreWeights> {
        self.profiles.get(category).copied()
    }

    /// Weights for `category`, falling back to the sensor profile
    pub fn resolve(&self, category: &str) -> ScoreWeights {
        self.get(category)
            .or_else(|| self.get(DEFAULT_CATEGORY))
            .unwrap_or(BUILTIN_PROFILES[0].1)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.profiles.contains_key(category)
    }

    /// Category names in sorted order
    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate every profile in the table
    pub fn validate(&self) -> Result<(), String> {
        for name in self.categories() {
            if let Some(weights) = self.profiles.get(&name) {
                weights
                    .validate()
                    .map_err(|e| format!("profile '{name}': {e}"))?;
            }
        }
        Ok(())
    }
}
