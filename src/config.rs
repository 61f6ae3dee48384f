//! TOML configuration for the adaptive publisher
//!
//! Every section is optional; omitted fields take the defaults of the
//! reference deployment (three local brokers, `sensor` weights, 20 s monitor
//! tick). The file sections are converted into the runtime structs used by
//! the monitor and orchestrator, which carry `Duration`s instead of seconds.

use crate::broker::{ScoreWeights, WeightTable, DEFAULT_CATEGORY};
use crate::monitor::{MonitorConfig, ProbeConfig};
use crate::orchestrator::OrchestratorConfig;
use crate::transport::mqtt::{parse_broker_uri, WillMessage};
use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PublisherConfig {
    pub publisher: PublisherSection,
    pub mqtt: MqttSection,
    pub monitor: MonitorSection,
    pub failover: FailoverSection,
    /// Custom weight profiles, extending or overriding the builtin table
    pub weights: HashMap<String, ScoreWeights>,
}

/// Publisher identity and demo loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublisherSection {
    pub client_id: String,
    /// Device category selecting the weight profile
    pub category: String,
    pub publish_topic: String,
    pub publish_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub will_topic: Option<String>,
    pub will_payload: Option<String>,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            client_id: "self_adaptive_publisher".to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            publish_topic: "test/message".to_string(),
            publish_interval_secs: 5,
            stats_interval_secs: 30,
            will_topic: Some("test/status".to_string()),
            will_payload: Some("Publisher disconnected".to_string()),
        }
    }
}

/// MQTT connection settings shared by every broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Candidate broker URIs in preference order
    pub brokers: Vec<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            brokers: vec![
                "mqtt://localhost:1883".to_string(),
                "mqtt://localhost:1884".to_string(),
                "mqtt://localhost:1885".to_string(),
            ],
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

/// Probe cadences, timeouts and test topics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSection {
    pub tick_interval_secs: u64,
    pub latency_interval_secs: u64,
    pub bandwidth_interval_secs: u64,
    pub connection_check_interval_secs: u64,
    pub latency_timeout_secs: u64,
    pub bandwidth_timeout_secs: u64,
    pub connection_count_timeout_secs: u64,
    pub probe_connect_timeout_secs: u64,
    pub probe_qos: u8,
    pub latency_topic: String,
    pub bandwidth_topic: String,
    pub connection_count_topic: String,
    pub bandwidth_message_count: usize,
    pub bandwidth_message_size: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let probe = ProbeConfig::default();
        let monitor = MonitorConfig::default();
        Self {
            tick_interval_secs: monitor.tick_interval.as_secs(),
            latency_interval_secs: monitor.latency_interval.as_secs(),
            bandwidth_interval_secs: monitor.bandwidth_interval.as_secs(),
            connection_check_interval_secs: monitor.connection_check_interval.as_secs(),
            latency_timeout_secs: probe.latency_timeout.as_secs(),
            bandwidth_timeout_secs: probe.bandwidth_timeout.as_secs(),
            connection_count_timeout_secs: probe.connection_count_timeout.as_secs(),
            probe_connect_timeout_secs: probe.connect_timeout.as_secs(),
            probe_qos: probe.qos.into(),
            latency_topic: probe.latency_topic,
            bandwidth_topic: probe.bandwidth_topic,
            connection_count_topic: probe.connection_count_topic,
            bandwidth_message_count: probe.bandwidth_message_count,
            bandwidth_message_size: probe.bandwidth_message_size,
        }
    }
}

/// Failover pacing and queue bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailoverSection {
    pub backoff_secs: u64,
    pub max_queue_size: usize,
    pub disconnect_timeout_secs: u64,
}

impl Default for FailoverSection {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            backoff_secs: orchestrator.failover_backoff.as_secs(),
            max_queue_size: orchestrator.max_queue_size,
            disconnect_timeout_secs: orchestrator.disconnect_timeout.as_secs(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid weights for category '{category}': {reason}")]
    InvalidWeights { category: String, reason: String },
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

impl PublisherConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PublisherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "publisher.client_id must not be empty".to_string(),
            ));
        }

        for uri in &self.mqtt.brokers {
            parse_broker_uri(uri).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        }

        if self.monitor.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "monitor.tick_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.monitor.bandwidth_message_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "monitor.bandwidth_message_count must be non-zero".to_string(),
            ));
        }
        QoS::try_from(self.monitor.probe_qos)
            .map_err(|_| ConfigError::InvalidQos(self.monitor.probe_qos))?;

        if self.failover.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "failover.max_queue_size must be greater than zero".to_string(),
            ));
        }

        for (category, weights) in &self.weights {
            weights
                .validate()
                .map_err(|reason| ConfigError::InvalidWeights {
                    category: category.clone(),
                    reason,
                })?;
        }

        Ok(())
    }

    /// Builtin category table with this file's custom profiles applied
    pub fn weight_table(&self) -> WeightTable {
        self.weights
            .iter()
            .fold(WeightTable::builtin(), |table, (category, weights)| {
                table.with_profile(category.clone(), *weights)
            })
    }

    pub fn monitor_config(&self) -> Result<MonitorConfig, ConfigError> {
        let m = &self.monitor;
        let qos = QoS::try_from(m.probe_qos).map_err(|_| ConfigError::InvalidQos(m.probe_qos))?;

        Ok(MonitorConfig {
            tick_interval: Duration::from_secs(m.tick_interval_secs),
            latency_interval: Duration::from_secs(m.latency_interval_secs),
            bandwidth_interval: Duration::from_secs(m.bandwidth_interval_secs),
            connection_check_interval: Duration::from_secs(m.connection_check_interval_secs),
            probe: ProbeConfig {
                connect_timeout: Duration::from_secs(m.probe_connect_timeout_secs),
                latency_timeout: Duration::from_secs(m.latency_timeout_secs),
                bandwidth_timeout: Duration::from_secs(m.bandwidth_timeout_secs),
                connection_count_timeout: Duration::from_secs(m.connection_count_timeout_secs),
                qos,
                latency_topic: m.latency_topic.clone(),
                bandwidth_topic: m.bandwidth_topic.clone(),
                connection_count_topic: m.connection_count_topic.clone(),
                bandwidth_message_count: m.bandwidth_message_count,
                bandwidth_message_size: m.bandwidth_message_size,
                ..ProbeConfig::default()
            },
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            client_id: self.publisher.client_id.clone(),
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            failover_backoff: Duration::from_secs(self.failover.backoff_secs),
            max_queue_size: self.failover.max_queue_size,
            disconnect_timeout: Duration::from_secs(self.failover.disconnect_timeout_secs),
        }
    }

    /// Last will for orchestrator connections, when both topic and payload are set
    pub fn will_message(&self) -> Option<WillMessage> {
        match (&self.publisher.will_topic, &self.publisher.will_payload) {
            (Some(topic), Some(payload)) => Some(WillMessage {
                topic: topic.clone(),
                payload: payload.clone(),
                qos: QoS::AtLeastOnce,
                retained: false,
            }),
            _ => None,
        }
    }
}
