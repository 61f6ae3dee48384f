//! Impure I/O operations for the rumqttc transport
//!
//! Each [`RumqttTransport`] owns one rumqttc client and the task polling its
//! event loop. The task never reconnects on its own: a dropped connection is
//! reported once through the event sink and the task stops, leaving broker
//! selection to the caller.

use super::connection::{configure_mqtt_options, to_rumqttc_qos, ConnectionState, WillMessage};
use super::message_handler::{EventRoute, MessageHandler, PendingDeliveries};
use crate::config::MqttSection;
use crate::transport::{
    DeliveryToken, EventSink, QoS, TokenGenerator, TransportClient, TransportError,
    TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request channel capacity between the client handle and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

fn lock_pending(pending: &Mutex<PendingDeliveries>) -> MutexGuard<'_, PendingDeliveries> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the client handle and its event loop task
struct EventLoopContext {
    broker_uri: String,
    events: EventSink,
    pending: Arc<Mutex<PendingDeliveries>>,
    closing: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnectionState>,
}

impl EventLoopContext {
    /// Record the end of the connection, reporting loss only for an
    /// established connection that was not closed on purpose
    fn connection_ended(&self, cause: String) {
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        self.state_tx
            .send_replace(ConnectionState::Disconnected(cause.clone()));

        if was_connected && !self.closing.load(Ordering::SeqCst) {
            warn!(broker = %self.broker_uri, cause = %cause, "Connection lost");
            self.events.emit(TransportEvent::ConnectionLost { cause });
        }
    }

    fn complete_delivery(&self, token: Option<DeliveryToken>) {
        if let Some(token) = token {
            self.events.emit(TransportEvent::DeliveryComplete(token));
        }
    }
}

/// rumqttc-backed client for a single broker connection
pub struct RumqttTransport {
    broker_uri: String,
    client: AsyncClient,
    // rumqttc's EventLoop is Send but not Sync
    event_loop: Mutex<Option<EventLoop>>,
    events: EventSink,
    pending: Arc<Mutex<PendingDeliveries>>,
    tokens: TokenGenerator,
    publish_order: tokio::sync::Mutex<()>,
    closing: Arc<AtomicBool>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl RumqttTransport {
    pub fn new(
        client_id: &str,
        broker_uri: &str,
        config: &MqttSection,
        will: Option<&WillMessage>,
        events: EventSink,
    ) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(client_id, broker_uri, config, will)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        Ok(Self {
            broker_uri: broker_uri.to_string(),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            events,
            pending: Arc::new(Mutex::new(PendingDeliveries::new())),
            tokens: TokenGenerator::default(),
            publish_order: tokio::sync::Mutex::new(()),
            closing: Arc::new(AtomicBool::new(false)),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
        })
    }

    /// Current connection state, None before `connect` was called
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        match self.connection_state() {
            Some(ConnectionState::Connected) => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Wait for ConnAck, a refusal or the timeout, whichever comes first
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        broker_uri: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionRefused {
                            uri: broker_uri.to_string(),
                            reason: reason.clone(),
                        })
                    }
                    ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionRefused {
                        uri: broker_uri.to_string(),
                        reason: "event loop stopped".to_string(),
                    });
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(TransportError::ConnectTimeout {
                uri: broker_uri.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        })
    }

    /// Apply one routed event; false stops the event loop
    fn process_event_route(route: EventRoute, ctx: &EventLoopContext) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                info!(broker = %ctx.broker_uri, "Connected to broker");
                ctx.state_tx.send_replace(ConnectionState::Connected);
                ctx.events.emit(TransportEvent::Connected);
                true
            }
            EventRoute::ConnectionRefused(reason) => {
                ctx.state_tx
                    .send_replace(ConnectionState::Disconnected(reason));
                false
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Message received");
                ctx.events
                    .emit(TransportEvent::MessageArrived { topic, payload });
                true
            }
            EventRoute::PublishSent(pkid) => {
                let token = lock_pending(&ctx.pending).on_publish_sent(pkid);
                ctx.complete_delivery(token);
                true
            }
            EventRoute::DeliveryConfirmed(pkid) => {
                let token = lock_pending(&ctx.pending).on_confirmed(pkid);
                ctx.complete_delivery(token);
                true
            }
            EventRoute::Disconnected => {
                ctx.connection_ended("disconnected by broker".to_string());
                false
            }
            EventRoute::DisconnectSent => {
                ctx.connection_ended("client disconnected".to_string());
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        ctx: EventLoopContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", broker = %ctx.broker_uri, "Event loop shutdown requested");
                        ctx.connection_ended("event loop shut down".to_string());
                        break;
                    }
                }
                polled = event_loop.poll() => {
                    match polled {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &ctx) {
                                break;
                            }
                        }
                        Err(e) => {
                            ctx.connection_ended(e.to_string());
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "mqtt_transport", broker = %ctx.broker_uri, "Event loop stopped");
    }

    fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportClient for RumqttTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(TransportError::AlreadyConnected)?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = EventLoopContext {
            broker_uri: self.broker_uri.clone(),
            events: self.events.clone(),
            pending: self.pending.clone(),
            closing: self.closing.clone(),
            state_tx,
        };

        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop_handle = Some(tokio::spawn(Self::run_event_loop(
            event_loop,
            ctx,
            shutdown_rx,
        )));

        let confirmed =
            Self::wait_for_connection_confirmation(state_rx, &self.broker_uri, timeout).await;
        if confirmed.is_err() {
            self.closing.store(true, Ordering::SeqCst);
            self.stop_event_loop();
        }
        confirmed
    }

    async fn disconnect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);

        let Some(handle) = self.event_loop_handle.take() else {
            return Err(TransportError::NotConnected);
        };

        let requested = if handle.is_finished() {
            Err(TransportError::NotConnected)
        } else {
            self.client
                .disconnect()
                .await
                .map_err(|e| TransportError::DisconnectFailed(e.to_string()))
        };

        let mut handle = handle;
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!(broker = %self.broker_uri, "Event loop did not stop in time, aborting");
            handle.abort();
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        requested
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<DeliveryToken, TransportError> {
        self.check_connected()?;

        let token = self.tokens.next();
        // Registration order must match the order requests reach the event loop
        let _order = self.publish_order.lock().await;
        lock_pending(&self.pending).register(token, qos);

        if let Err(e) = self
            .client
            .publish(topic, to_rumqttc_qos(qos), retained, payload)
            .await
        {
            lock_pending(&self.pending).cancel(token);
            return Err(TransportError::PublishFailed(e.to_string()));
        }

        debug!(target: "mqtt_transport", topic = %topic, token = %token, "Publish queued");
        Ok(token)
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.check_connected()?;
        self.client
            .subscribe(topic_filter, to_rumqttc_qos(qos))
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("{topic_filter}: {e}")))
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        self.client
            .unsubscribe(topic_filter)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed(format!("{topic_filter}: {e}")))
    }

    fn broker_uri(&self) -> &str {
        &self.broker_uri
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop_event_loop();
    }
}

/// Creates [`RumqttTransport`] clients sharing one MQTT configuration
#[derive(Debug, Clone, Default)]
pub struct RumqttTransportFactory {
    mqtt: MqttSection,
    will: Option<WillMessage>,
}

impl RumqttTransportFactory {
    pub fn new(mqtt: MqttSection) -> Self {
        Self { mqtt, will: None }
    }

    /// Register a last will with every client this factory creates
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }
}

impl TransportFactory for RumqttTransportFactory {
    fn create(
        &self,
        broker_uri: &str,
        client_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn TransportClient>, TransportError> {
        let transport =
            RumqttTransport::new(client_id, broker_uri, &self.mqtt, self.will.as_ref(), events)?;
        Ok(Box::new(transport))
    }
}
