//! Thread-safe registry of known brokers
//!
//! Owns every [`BrokerRecord`] plus the index of the currently selected
//! broker. All operations take the registry lock for their whole duration and
//! hand out copies, never references into the guarded state.

use super::record::BrokerRecord;
use super::weights::{ScoreWeights, WeightTable};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Minimum score advantage the best broker needs over the current one
pub const SWITCH_HYSTERESIS: f64 = 0.1;

#[derive(Debug, Default)]
struct RegistryState {
    brokers: Vec<BrokerRecord>,
    /// Index of the selected broker; `None` only while `brokers` is empty
    current: Option<usize>,
}

impl RegistryState {
    fn position(&self, uri: &str) -> Option<usize> {
        self.brokers.iter().position(|b| b.uri == uri)
    }

    fn find_mut(&mut self, uri: &str) -> Option<&mut BrokerRecord> {
        self.brokers.iter_mut().find(|b| b.uri == uri)
    }

    fn current(&self) -> Option<&BrokerRecord> {
        self.current.and_then(|i| self.brokers.get(i))
    }

    fn add(&mut self, uri: &str) -> bool {
        if self.position(uri).is_some() {
            return false;
        }
        self.brokers.push(BrokerRecord::new(uri));
        if self.brokers.len() == 1 {
            self.current = Some(0);
        }
        true
    }

    fn best(&self) -> Option<&BrokerRecord> {
        // Strict comparison keeps the earliest record on ties
        let mut best: Option<&BrokerRecord> = None;
        for broker in self.brokers.iter().filter(|b| b.available) {
            match best {
                Some(b) if broker.score <= b.score => {}
                _ => best = Some(broker),
            }
        }
        best
    }
}

/// Registry of brokers with live metrics and scores
#[derive(Debug)]
pub struct BrokerRegistry {
    state: Mutex<RegistryState>,
    category: String,
    weights: ScoreWeights,
}

impl BrokerRegistry {
    /// Create an empty registry scoring with `category`'s profile from `table`
    pub fn new(category: impl Into<String>, table: &WeightTable) -> Self {
        let category = category.into();
        if !table.contains(&category) {
            warn!(category = %category, "Unknown broker category, using sensor weights");
        }
        let weights = table.resolve(&category);
        Self {
            state: Mutex::new(RegistryState::default()),
            category,
            weights,
        }
    }

    /// Create a registry with explicit weights
    pub fn with_weights(category: impl Into<String>, weights: ScoreWeights) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            category: category.into(),
            weights,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock still guards valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Append a broker with zeroed metrics; no-op if already known
    pub fn add(&self, uri: &str) {
        if self.lock().add(uri) {
            debug!(broker = %uri, "Broker added to registry");
        }
    }

    /// Remove a broker, keeping the current selection valid
    pub fn remove(&self, uri: &str) {
        let mut state = self.lock();
        let Some(removed) = state.position(uri) else {
            return;
        };
        state.brokers.remove(removed);

        let remaining = state.brokers.len();
        state.current = match state.current {
            _ if remaining == 0 => None,
            Some(current) if removed < current => Some(current - 1),
            Some(current) if current >= remaining => Some(remaining - 1),
            other => other,
        };
        debug!(broker = %uri, "Broker removed from registry");
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.brokers.clear();
        state.current = None;
    }

    /// Replace the whole broker list in one step
    pub fn replace_all<S: AsRef<str>>(&self, uris: &[S]) {
        let mut state = self.lock();
        state.brokers.clear();
        state.current = None;
        for uri in uris {
            state.add(uri.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().brokers.is_empty()
    }

    pub fn list_uris(&self) -> Vec<String> {
        self.lock().brokers.iter().map(|b| b.uri.clone()).collect()
    }

    pub fn list_all(&self) -> Vec<BrokerRecord> {
        self.lock().brokers.clone()
    }

    /// URIs of available brokers, in registry order
    pub fn available_uris(&self) -> Vec<String> {
        self.lock()
            .brokers
            .iter()
            .filter(|b| b.available)
            .map(|b| b.uri.clone())
            .collect()
    }

    pub fn get(&self, uri: &str) -> Option<BrokerRecord> {
        let state = self.lock();
        state.position(uri).map(|i| state.brokers[i].clone())
    }

    pub fn is_available(&self, uri: &str) -> bool {
        self.get(uri).is_some_and(|b| b.available)
    }

    pub fn current(&self) -> Option<BrokerRecord> {
        self.lock().current().cloned()
    }

    /// URI of the selected broker, or an empty string
    pub fn current_uri(&self) -> String {
        self.lock()
            .current()
            .map(|b| b.uri.clone())
            .unwrap_or_default()
    }

    /// Select `uri` as current; false if it is not known
    pub fn set_current(&self, uri: &str) -> bool {
        let mut state = self.lock();
        match state.position(uri) {
            Some(index) => {
                state.current = Some(index);
                true
            }
            None => false,
        }
    }

    /// Highest-scoring available broker, first in order on ties
    pub fn find_best(&self) -> Option<BrokerRecord> {
        self.lock().best().cloned()
    }

    /// Whether the best broker beats the current one by more than the hysteresis margin
    pub fn should_switch(&self) -> bool {
        let state = self.lock();
        match (state.current(), state.best()) {
            (Some(current), Some(best)) if current.uri != best.uri => {
                best.score - current.score > SWITCH_HYSTERESIS
            }
            _ => false,
        }
    }

    /// Store fresh metrics and recompute the score; no-op for unknown URIs
    pub fn update_metrics(&self, uri: &str, latency: f64, bandwidth: f64, connection_count: u32) {
        let weights = self.weights;
        let mut state = self.lock();
        if let Some(broker) = state.find_mut(uri) {
            broker.latency = latency;
            broker.bandwidth = bandwidth;
            broker.connection_count = connection_count;
            broker.last_check = Instant::now();
            broker.recompute_score(&weights);
            debug!(
                broker = %uri,
                latency, bandwidth, connection_count,
                score = broker.score,
                "Broker metrics updated"
            );
        }
    }

    pub fn mark_unavailable(&self, uri: &str) {
        let mut state = self.lock();
        if let Some(broker) = state.find_mut(uri) {
            if broker.available {
                warn!(broker = %uri, "Broker marked unavailable");
            }
            broker.available = false;
            broker.score = 0.0;
        }
    }

    pub fn mark_available(&self, uri: &str) {
        let weights = self.weights;
        let mut state = self.lock();
        if let Some(broker) = state.find_mut(uri) {
            let was_available = broker.available;
            broker.available = true;
            broker.recompute_score(&weights);
            if !was_available {
                info!(broker = %uri, score = broker.score, "Broker marked available");
            }
        }
    }
}
