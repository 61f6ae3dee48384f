//! Adaptive Publisher - self-adaptive MQTT broker selection and failover
//!
//! A publisher that keeps one MQTT connection alive across a set of candidate
//! brokers. A background monitor measures each broker's latency, bandwidth
//! and connection count, scores them with per-device-category weights, and
//! recommends a switch when another broker is clearly better. Connection
//! failures fail over to the next available broker while outbound messages
//! wait in a bounded queue.
//!
//! # Overview
//!
//! - [`broker`]: weight profiles, broker records and the scored registry
//! - [`monitor`]: periodic latency / bandwidth / connection-count probes
//! - [`orchestrator`]: connect, failover, publish queueing and flushing
//! - [`publisher`]: the [`AdaptivePublisher`] facade tying them together
//! - [`transport`]: the MQTT capability set and its rumqttc implementation
//!
//! # Quick Start
//!
//! ```rust
//! use adaptive_publisher::broker::{BrokerRegistry, WeightTable};
//!
//! let registry = BrokerRegistry::new("sensor", &WeightTable::builtin());
//! registry.add("mqtt://broker-a:1883");
//! registry.add("mqtt://broker-b:1883");
//!
//! registry.update_metrics("mqtt://broker-a:1883", 50.0, 2_000_000.0, 10);
//! registry.update_metrics("mqtt://broker-b:1883", 200.0, 2_000_000.0, 10);
//!
//! let best = registry.find_best().unwrap();
//! assert_eq!(best.uri, "mqtt://broker-a:1883");
//! assert!((best.score - 0.68).abs() < 1e-9);
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod publisher;
pub mod testing;
pub mod transport;

pub use broker::{BrokerRecord, BrokerRegistry, ScoreWeights, WeightTable};
pub use config::{ConfigError, PublisherConfig};
pub use error::{PublisherError, PublisherResult};
pub use monitor::{BrokerMonitor, MonitorConfig, MonitorEvent};
pub use orchestrator::{ConnectionOrchestrator, ConnectionState, OrchestratorConfig};
pub use publisher::{AdaptivePublisher, PublisherSettings};
pub use transport::{DeliveryToken, QoS};
