//! rumqttc implementation of the transport capability set
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - broker URI parsing and rumqttc option construction
//! - [`message_handler`] - event routing and delivery-token tracking
//! - [`client`] - the client handle and its event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use adaptive_publisher::config::MqttSection;
//! use adaptive_publisher::transport::mqtt::RumqttTransportFactory;
//! use adaptive_publisher::transport::{EventSink, QoS, TransportFactory};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let factory = RumqttTransportFactory::new(MqttSection::default());
//! let (events, _rx) = EventSink::standalone();
//! let mut client = factory.create("mqtt://localhost:1883", "my-client", events)?;
//! client.connect(Duration::from_secs(10)).await?;
//! client.publish("test/message", "hello".into(), QoS::AtLeastOnce, false).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{RumqttTransport, RumqttTransportFactory};
pub use connection::{parse_broker_uri, BrokerAddress, ConnectionState, WillMessage};
pub use message_handler::{EventRoute, MessageHandler, PendingDeliveries};
