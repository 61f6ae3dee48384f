//! Configuration loading and validation tests
//!
//! Tests focus on the behaviour of loading a publisher from TOML: defaults,
//! overrides, validation errors and the runtime settings derived from them.

use adaptive_publisher::config::{ConfigError, PublisherConfig};
use adaptive_publisher::{AdaptivePublisher, PublisherError, QoS};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[publisher]
client_id = "line-3-sensor"
category = "meter"

[mqtt]
brokers = ["tcp://10.0.0.1:1883", "mqtts://broker.example.com"]
keep_alive_secs = 20

[monitor]
latency_interval_secs = 2
probe_qos = 2

[failover]
backoff_secs = 1
max_queue_size = 250
"#,
    );

    let config = PublisherConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.publisher.client_id, "line-3-sensor");
    assert_eq!(config.publisher.category, "meter");
    assert_eq!(config.mqtt.brokers.len(), 2);
    assert_eq!(config.mqtt.keep_alive_secs, 20);

    let monitor = config.monitor_config().unwrap();
    assert_eq!(monitor.latency_interval, Duration::from_secs(2));
    assert_eq!(monitor.bandwidth_interval, Duration::from_secs(10));
    assert_eq!(monitor.probe.qos, QoS::ExactlyOnce);

    let orchestrator = config.orchestrator_config();
    assert_eq!(orchestrator.client_id, "line-3-sensor");
    assert_eq!(orchestrator.failover_backoff, Duration::from_secs(1));
    assert_eq!(orchestrator.max_queue_size, 250);
}

#[test]
fn test_config_custom_weights_extend_builtin_table() {
    let temp_file = write_config(
        r#"
[publisher]
category = "forklift"

[weights.forklift]
latency = 0.1
bandwidth = 0.1
connection = 0.8
"#,
    );

    let config = PublisherConfig::load_from_file(temp_file.path()).unwrap();
    let table = config.weight_table();
    assert!(table.contains("forklift"));
    assert!(table.contains("drone"));
    assert_eq!(table.resolve("forklift").connection, 0.8);
}

#[test]
fn test_config_rejects_weights_not_summing_to_one() {
    let temp_file = write_config(
        r#"
[weights.broken]
latency = 0.5
bandwidth = 0.5
connection = 0.5
"#,
    );

    let result = PublisherConfig::load_from_file(temp_file.path());
    assert!(matches!(
        result,
        Err(ConfigError::InvalidWeights { ref category, .. }) if category == "broken"
    ));
}

#[test]
fn test_config_rejects_invalid_broker_uri() {
    let temp_file = write_config(
        r#"
[mqtt]
brokers = ["http://not-mqtt:80"]
"#,
    );

    assert!(matches!(
        PublisherConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_rejects_invalid_probe_qos() {
    let temp_file = write_config("[monitor]\nprobe_qos = 3\n");

    assert!(matches!(
        PublisherConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidQos(3))
    ));
}

#[test]
fn test_config_missing_file_is_read_error() {
    let result = PublisherConfig::load_from_file(std::path::Path::new("/nonexistent/publisher.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[tokio::test]
async fn test_publisher_built_from_loaded_config() {
    let temp_file = write_config(
        r#"
[publisher]
category = "drone"

[mqtt]
brokers = ["mqtt://127.0.0.1:1", "mqtt://127.0.0.1:2"]
"#,
    );

    let config = PublisherConfig::load_from_file(temp_file.path()).unwrap();
    let publisher = AdaptivePublisher::from_config(&config).unwrap();

    assert_eq!(publisher.category(), "drone");
    let uris: Vec<_> = publisher.broker_stats().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, config.mqtt.brokers);
    assert_eq!(publisher.current_broker_uri(), "");

    let error = publisher.subscribe("a/#", QoS::AtLeastOnce).await.unwrap_err();
    assert!(matches!(error, PublisherError::NotConnected));
}
