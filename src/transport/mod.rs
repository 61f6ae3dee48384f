//! Transport layer for broker connections
//!
//! This module defines the capability set the publisher needs from an
//! MQTT-style client, plus the rumqttc implementation of it. Clients report
//! asynchronous events (connected, connection lost, message arrived, delivery
//! complete) through a typed [`EventSink`] rather than callbacks.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Delivery guarantee requested for a message or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransportError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Handle identifying one published message until its delivery completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeliveryToken(pub u64);

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of delivery tokens, shared per client
#[derive(Debug, Default)]
pub struct TokenGenerator(AtomicU64);

impl TokenGenerator {
    pub fn next(&self) -> DeliveryToken {
        DeliveryToken(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Asynchronous events reported by a transport client
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost { cause: String },
    MessageArrived { topic: String, payload: Bytes },
    DeliveryComplete(DeliveryToken),
}

/// Event tagged with the connection generation of the client that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half handed to a transport client for event delivery
///
/// The channel is unbounded so a client's network task never blocks on a
/// slow consumer.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Sink plus its receiver, for a single transient client
    pub fn standalone() -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(0, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; false once the consumer has gone away
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URI: {0}")]
    InvalidBrokerUri(String),
    #[error("Connection to {uri} refused: {reason}")]
    ConnectionRefused { uri: String, reason: String },
    #[error("Connection to {uri} timed out after {timeout_ms}ms")]
    ConnectTimeout { uri: String, timeout_ms: u64 },
    #[error("Client is not connected")]
    NotConnected,
    #[error("Client is already connected")]
    AlreadyConnected,
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(String),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
}

/// One connection to one broker
///
/// A client is created per connection attempt and discarded afterwards; it
/// is never reconnected to a different broker.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Connect and wait for the broker's acknowledgement, bounded by `timeout`
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Disconnect cleanly, bounded by `timeout`; never reports connection loss
    async fn disconnect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<DeliveryToken, TransportError>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError>;

    fn broker_uri(&self) -> &str;
}

/// Builds transport clients targeted at a broker URI
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        broker_uri: &str,
        client_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn TransportClient>, TransportError>;
}

/// Type alias for the rumqttc-backed factory
pub type MqttTransportFactory = mqtt::RumqttTransportFactory;
