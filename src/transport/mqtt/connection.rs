//! Pure connection configuration for the rumqttc transport
//!
//! This module contains pure functions for broker URI parsing, option
//! construction and the connection state reported by the event loop task.

use crate::config::MqttSection;
use crate::transport::{QoS, TransportError};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS as RumqttcQoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Connection state reported by the event loop task
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for ConnAck
    Connecting,
    /// ConnAck received
    Connected,
    /// Refused, dropped or closed, with reason
    Disconnected(String),
}

/// Host, port and TLS flag extracted from a broker URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` broker URIs
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, TransportError> {
    let url = Url::parse(uri).map_err(|_| TransportError::InvalidBrokerUri(uri.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" => true,
        _ => return Err(TransportError::InvalidBrokerUri(uri.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUri(uri.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

pub fn to_rumqttc_qos(qos: QoS) -> RumqttcQoS {
    match qos {
        QoS::AtMostOnce => RumqttcQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttcQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttcQoS::ExactlyOnce,
    }
}

/// Last will registered with the broker on connect
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retained: bool,
}

/// Pure function to build rumqttc options for one broker connection
pub fn configure_mqtt_options(
    client_id: &str,
    broker_uri: &str,
    config: &MqttSection,
    will: Option<&WillMessage>,
) -> Result<MqttOptions, TransportError> {
    let address = parse_broker_uri(broker_uri)?;
    let mut mqtt_options = MqttOptions::new(client_id, address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials are resolved from the environment at connect time
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_start(true);

    if let Some(will) = will {
        let lwt = LastWill::new(
            &will.topic,
            will.payload.clone(),
            to_rumqttc_qos(will.qos),
            will.retained,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    Ok(mqtt_options)
}
