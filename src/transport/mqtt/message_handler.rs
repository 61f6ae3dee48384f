//! Pure event routing and delivery tracking for the rumqttc event loop
//!
//! rumqttc does not hand back a packet id from `publish`, so delivery tokens
//! are matched to packet ids by order: publish requests leave the event loop
//! in the order they were queued.

use crate::transport::{DeliveryToken, QoS};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Routing decision for one rumqttc event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    ConnectionRefused(String),
    MessageReceived { topic: String, payload: Bytes },
    /// A publish left the client with this packet id
    PublishSent(u16),
    /// PubAck / PubComp for this packet id
    DeliveryConfirmed(u16),
    /// Broker sent Disconnect
    Disconnected,
    /// Our own Disconnect went out
    DisconnectSent,
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(puback) => EventRoute::DeliveryConfirmed(puback.pkid),
                Packet::PubComp(pubcomp) => EventRoute::DeliveryConfirmed(pubcomp.pkid),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => Self::route_outgoing(outgoing),
        }
    }

    fn route_outgoing(outgoing: &Outgoing) -> EventRoute {
        match outgoing {
            Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            _ => EventRoute::OutgoingEvent,
        }
    }
}

/// Tracks published messages until the broker confirms them
#[derive(Debug, Default)]
pub struct PendingDeliveries {
    /// Queued publishes not yet seen leaving the event loop
    queued: VecDeque<(DeliveryToken, QoS)>,
    /// Sent QoS 1/2 publishes awaiting acknowledgement
    inflight: HashMap<u16, DeliveryToken>,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish request about to be handed to the client
    pub fn register(&mut self, token: DeliveryToken, qos: QoS) {
        self.queued.push_back((token, qos));
    }

    /// Forget the most recent registration after the request was rejected
    pub fn cancel(&mut self, token: DeliveryToken) {
        if let Some(pos) = self.queued.iter().rposition(|(t, _)| *t == token) {
            self.queued.remove(pos);
        }
    }

    /// A publish left the client; QoS 0 deliveries complete immediately
    pub fn on_publish_sent(&mut self, pkid: u16) -> Option<DeliveryToken> {
        let (token, qos) = self.queued.pop_front()?;
        if qos == QoS::AtMostOnce {
            return Some(token);
        }
        self.inflight.insert(pkid, token);
        None
    }

    pub fn on_confirmed(&mut self, pkid: u16) -> Option<DeliveryToken> {
        let token = self.inflight.remove(&pkid);
        if token.is_none() {
            debug!(target: "mqtt_transport", pkid, "Acknowledgement for unknown packet id");
        }
        token
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
