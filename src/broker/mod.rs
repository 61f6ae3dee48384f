//! Broker bookkeeping: weight profiles, per-broker metrics and the registry
//!
//! This is the leaf of the crate. It performs no I/O; the monitor writes
//! metrics into the registry and the orchestrator reads its ordering.

pub mod record;
pub mod registry;
pub mod weights;

pub use record::{compute_score, BrokerRecord};
pub use registry::{BrokerRegistry, SWITCH_HYSTERESIS};
pub use weights::{ScoreWeights, WeightTable, DEFAULT_CATEGORY};
