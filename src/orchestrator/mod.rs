//! Connection orchestration and failover
//!
//! [`ConnectionOrchestrator`] owns the one live broker connection. It walks the
//! registry's available brokers on connect, fails over when the connection
//! drops or the monitor recommends a better broker, and buffers publishes in a
//! bounded queue while no connection is usable.
//!
//! Transport events arrive on a single channel, tagged with the generation of
//! the client that produced them. Replacing or tearing down a client bumps the
//! generation, so lifecycle events from discarded clients are ignored.

pub mod queue;
pub mod state;

pub use queue::{MessageQueue, QueuedMessage, MAX_QUEUE_SIZE};
pub use state::{next_state, ConnectionState, ConnectionTrigger, FailoverGuard, FailoverSlot};

use crate::broker::BrokerRegistry;
use crate::error::{PublisherError, PublisherResult};
use crate::failover_span;
use crate::transport::{
    DeliveryToken, EventSink, QoS, TaggedEvent, TransportClient, TransportError, TransportEvent,
    TransportFactory,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Connection and failover settings
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub client_id: String,
    pub connect_timeout: Duration,
    /// Pause after a failover pass found no reachable broker
    pub failover_backoff: Duration,
    pub max_queue_size: usize,
    pub disconnect_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            client_id: "self_adaptive_publisher".to_string(),
            connect_timeout: Duration::from_secs(10),
            failover_backoff: Duration::from_secs(5),
            max_queue_size: MAX_QUEUE_SIZE,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// Invoked with the broker URI after every successful connect or failover
pub type ConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked with the loss cause when the live connection drops
pub type ConnectionLostCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked with topic and payload for every inbound message
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type DeliveryCallback = Arc<dyn Fn(DeliveryToken) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    connected: Option<ConnectedCallback>,
    connection_lost: Option<ConnectionLostCallback>,
    message: Option<MessageCallback>,
    delivery_complete: Option<DeliveryCallback>,
}

/// The live client plus the failover rotation position
#[derive(Default)]
struct ConnectionSlot {
    client: Option<Box<dyn TransportClient>>,
    try_index: usize,
}

enum PassOutcome {
    Connected,
    AlreadyConnected,
    NoCandidates,
    Exhausted,
}

/// Keeps one broker connection alive across broker failures
pub struct ConnectionOrchestrator {
    registry: Arc<BrokerRegistry>,
    factory: Arc<dyn TransportFactory>,
    config: OrchestratorConfig,
    slot: tokio::sync::Mutex<ConnectionSlot>,
    queue: MessageQueue,
    failover: FailoverSlot,
    generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    state_tx: watch::Sender<ConnectionState>,
    callbacks: RwLock<Callbacks>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Route transport events until the orchestrator is dropped
async fn dispatch_events(
    orchestrator: Weak<ConnectionOrchestrator>,
    mut events: mpsc::UnboundedReceiver<TaggedEvent>,
) {
    while let Some(tagged) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.handle_transport_event(tagged);
    }
    debug!("Transport event dispatcher stopped");
}

impl ConnectionOrchestrator {
    /// Create a disconnected orchestrator and spawn its event dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<BrokerRegistry>,
        factory: Arc<dyn TransportFactory>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let queue = MessageQueue::new(config.max_queue_size);

        let orchestrator = Arc::new(Self {
            registry,
            factory,
            config,
            slot: tokio::sync::Mutex::new(ConnectionSlot::default()),
            queue,
            failover: FailoverSlot::default(),
            generation: AtomicU64::new(0),
            events_tx,
            state_tx,
            callbacks: RwLock::new(Callbacks::default()),
            subscriptions: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_events(Arc::downgrade(&orchestrator), events_rx));
        *lock(&orchestrator.dispatcher) = Some(handle);
        orchestrator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    pub fn queued_message_count(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.queue.snapshot()
    }

    /// Subscriptions replayed after every connect, in subscribe order
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        self.callbacks_mut().connected = Some(callback);
    }

    pub fn set_connection_lost_callback(&self, callback: ConnectionLostCallback) {
        self.callbacks_mut().connection_lost = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks_mut().message = Some(callback);
    }

    pub fn set_delivery_complete_callback(&self, callback: DeliveryCallback) {
        self.callbacks_mut().delivery_complete = Some(callback);
    }

    fn callbacks(&self) -> Callbacks {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, trigger: ConnectionTrigger) {
        self.state_tx.send_if_modified(|state| {
            let next = next_state(state, trigger);
            if *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state changed");
            *state = next;
            true
        });
    }

    /// Connect to the first reachable available broker, in registry order
    ///
    /// Returns the current connection status without doing anything when a
    /// connection exists or an attempt is already running. Every broker that
    /// fails to connect is marked unavailable.
    pub async fn connect(&self) -> bool {
        if self.state().is_active() {
            return self.is_connected();
        }
        self.connect_in_order()
            .instrument(failover_span!(mode = "connect"))
            .await
    }

    async fn connect_in_order(&self) -> bool {
        let mut slot = self.slot.lock().await;
        if self.is_connected() {
            return true;
        }

        self.transition(ConnectionTrigger::AttemptStarted);
        let candidates = self.registry.available_uris();
        if candidates.is_empty() {
            warn!("No available brokers to connect to");
            self.transition(ConnectionTrigger::CandidatesExhausted);
            return false;
        }

        for (index, uri) in candidates.iter().enumerate() {
            match self.attempt(&mut slot, uri).await {
                Ok(()) => {
                    slot.try_index = index;
                    self.on_connected(&mut slot, uri).await;
                    return true;
                }
                Err(e) => self.attempt_failed(uri, &e),
            }
        }

        warn!(attempted = candidates.len(), "Could not connect to any broker");
        self.transition(ConnectionTrigger::CandidatesExhausted);
        false
    }

    /// Close the live connection; queued messages stay queued
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        let had_client = slot.client.is_some();
        self.release_client(&mut slot).await;
        self.transition(ConnectionTrigger::DisconnectRequested);
        if had_client {
            info!("Disconnected from broker");
        }
    }

    /// Tear down the current client and try available brokers from the
    /// rotation position onwards
    ///
    /// Collapses to `false` when another failover is already running. When a
    /// whole pass fails, the rotation resets and the call sleeps for the
    /// failover backoff before returning.
    pub async fn switch_to_best(&self) -> bool {
        self.failover(false).await
    }

    /// Act on a monitor recommendation if the registry still agrees with it
    pub async fn handle_switch_recommendation(&self, uri: &str) -> bool {
        if !self.registry.should_switch() {
            debug!(recommended = %uri, "Switch recommendation no longer holds");
            return false;
        }
        info!(
            current = %self.registry.current_uri(),
            recommended = %uri,
            "Switching brokers on monitor recommendation"
        );
        self.switch_to_best().await
    }

    /// Record a lost connection and start failover in the background
    pub fn handle_connection_lost(self: &Arc<Self>, cause: &str) {
        warn!(broker = %self.registry.current_uri(), cause, "Broker connection lost");
        self.transition(ConnectionTrigger::Lost(cause.to_string()));
        if let Some(callback) = self.callbacks().connection_lost {
            callback(cause);
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.failover(true).await;
        });
    }

    async fn failover(&self, skip_if_connected: bool) -> bool {
        let Some(_guard) = self.failover.try_acquire() else {
            debug!("Failover already in progress, ignoring trigger");
            return false;
        };

        let outcome = self
            .failover_pass(skip_if_connected)
            .instrument(failover_span!(mode = "failover"))
            .await;

        match outcome {
            PassOutcome::Connected | PassOutcome::AlreadyConnected => true,
            PassOutcome::NoCandidates => false,
            PassOutcome::Exhausted => {
                warn!(
                    backoff_ms = self.config.failover_backoff.as_millis() as u64,
                    "Tried every available broker, backing off"
                );
                tokio::time::sleep(self.config.failover_backoff).await;
                false
            }
        }
    }

    async fn failover_pass(&self, skip_if_connected: bool) -> PassOutcome {
        let mut slot = self.slot.lock().await;
        if skip_if_connected && self.is_connected() {
            debug!("Connection already restored, skipping failover");
            return PassOutcome::AlreadyConnected;
        }

        self.transition(ConnectionTrigger::AttemptStarted);
        self.release_client(&mut slot).await;

        let candidates = self.registry.available_uris();
        if candidates.is_empty() {
            warn!("No available brokers for failover");
            self.transition(ConnectionTrigger::CandidatesExhausted);
            return PassOutcome::NoCandidates;
        }

        if slot.try_index >= candidates.len() {
            slot.try_index = 0;
        }

        while let Some(uri) = candidates.get(slot.try_index) {
            debug!(
                broker = %uri,
                position = slot.try_index + 1,
                total = candidates.len(),
                "Trying broker"
            );
            match self.attempt(&mut slot, uri).await {
                Ok(()) => {
                    slot.try_index = 0;
                    self.on_connected(&mut slot, uri).await;
                    return PassOutcome::Connected;
                }
                Err(e) => {
                    self.attempt_failed(uri, &e);
                    slot.try_index += 1;
                }
            }
        }

        slot.try_index = 0;
        self.transition(ConnectionTrigger::CandidatesExhausted);
        PassOutcome::Exhausted
    }

    /// Replace the slot's client with a fresh one connected to `uri`
    async fn attempt(&self, slot: &mut ConnectionSlot, uri: &str) -> Result<(), TransportError> {
        self.release_client(slot).await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = EventSink::new(generation, self.events_tx.clone());
        let mut client = self.factory.create(uri, &self.config.client_id, events)?;

        info!(broker = %uri, "Connecting to broker");
        client.connect(self.config.connect_timeout).await?;
        slot.client = Some(client);
        Ok(())
    }

    fn attempt_failed(&self, uri: &str, error: &TransportError) {
        warn!(broker = %uri, error = %error, "Connection attempt failed, marking broker unavailable");
        self.registry.mark_unavailable(uri);
    }

    async fn release_client(&self, slot: &mut ConnectionSlot) {
        let Some(mut client) = slot.client.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = client.disconnect(self.config.disconnect_timeout).await {
            debug!(broker = %client.broker_uri(), error = %e, "Discarded client did not disconnect cleanly");
        }
    }

    async fn on_connected(&self, slot: &mut ConnectionSlot, uri: &str) {
        self.registry.set_current(uri);
        self.transition(ConnectionTrigger::AttemptSucceeded);
        info!(broker = %uri, "Connected to broker");

        self.replay_subscriptions(slot).await;
        self.flush_queue(slot).await;

        if let Some(callback) = self.callbacks().connected {
            callback(uri);
        }
    }

    /// Publish on the live connection, or queue the message when there is none
    ///
    /// Returns the delivery token when the message went out directly. Older
    /// queued messages are flushed first; if any remain, the new message is
    /// queued behind them. A failed direct publish queues the message as well.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Option<DeliveryToken> {
        let payload = payload.into();
        if self.is_connected() {
            let slot = self.slot.lock().await;
            if !self.queue.is_empty() {
                self.flush_queue(&slot).await;
            }
            if let (true, true, Some(client)) = (
                self.is_connected(),
                self.queue.is_empty(),
                slot.client.as_ref(),
            ) {
                match client.publish(topic, payload.clone(), qos, retained).await {
                    Ok(token) => {
                        debug!(topic, token = %token, "Published message");
                        return Some(token);
                    }
                    Err(e) => warn!(topic, error = %e, "Publish failed, queueing message"),
                }
            }
        }

        self.enqueue(QueuedMessage::new(topic, payload, qos, retained));

        // A connection may have come up after the check above
        if self.is_connected() {
            self.flush().await;
        }
        None
    }

    fn enqueue(&self, message: QueuedMessage) {
        let topic = message.topic.clone();
        if let Some(evicted) = self.queue.enqueue(message) {
            warn!(dropped_topic = %evicted.topic, "Message queue full, dropped oldest message");
        }
        debug!(topic = %topic, queued = self.queue.len(), "Queued message");
    }

    /// Re-publish queued messages in order on the live connection
    ///
    /// Stops at the first failure and leaves it and everything after it
    /// queued. Returns the number of messages sent.
    pub async fn flush(&self) -> usize {
        let slot = self.slot.lock().await;
        self.flush_queue(&slot).await
    }

    async fn flush_queue(&self, slot: &ConnectionSlot) -> usize {
        let Some(client) = slot.client.as_ref() else {
            return 0;
        };

        let mut sent = 0;
        while let Some(message) = self.queue.pop_front() {
            let result = client
                .publish(
                    &message.topic,
                    message.payload.clone(),
                    message.qos,
                    message.retained,
                )
                .await;
            match result {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(topic = %message.topic, error = %e, "Re-publishing queued message failed");
                    if let Some(dropped) = self.queue.requeue_front(message) {
                        warn!(dropped_topic = %dropped.topic, "Message queue full, dropped message");
                    }
                    break;
                }
            }
        }

        if sent > 0 {
            info!(sent, remaining = self.queue.len(), "Flushed queued messages");
        }
        sent
    }

    /// Subscribe on the live connection; remembered for replay after failover
    pub async fn subscribe(&self, topic_filter: &str, qos: QoS) -> PublisherResult<()> {
        if !self.is_connected() {
            return Err(PublisherError::NotConnected);
        }
        let slot = self.slot.lock().await;
        let client = slot.client.as_ref().ok_or(PublisherError::NotConnected)?;
        client.subscribe(topic_filter, qos).await?;

        let mut subscriptions = lock(&self.subscriptions);
        match subscriptions.iter_mut().find(|(filter, _)| filter == topic_filter) {
            Some(existing) => existing.1 = qos,
            None => subscriptions.push((topic_filter.to_string(), qos)),
        }
        info!(topic = %topic_filter, ?qos, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic_filter: &str) -> PublisherResult<()> {
        if !self.is_connected() {
            return Err(PublisherError::NotConnected);
        }
        let slot = self.slot.lock().await;
        let client = slot.client.as_ref().ok_or(PublisherError::NotConnected)?;
        client.unsubscribe(topic_filter).await?;

        lock(&self.subscriptions).retain(|(filter, _)| filter != topic_filter);
        info!(topic = %topic_filter, "Unsubscribed");
        Ok(())
    }

    async fn replay_subscriptions(&self, slot: &ConnectionSlot) {
        let Some(client) = slot.client.as_ref() else {
            return;
        };
        for (filter, qos) in self.subscriptions() {
            if let Err(e) = client.subscribe(&filter, qos).await {
                warn!(topic = %filter, error = %e, "Failed to restore subscription");
            }
        }
    }

    fn handle_transport_event(self: &Arc<Self>, tagged: TaggedEvent) {
        let current = tagged.generation == self.generation.load(Ordering::SeqCst);
        match tagged.event {
            TransportEvent::Connected => {
                debug!(generation = tagged.generation, "Transport confirmed connection");
            }
            TransportEvent::ConnectionLost { cause } if current && self.is_connected() => {
                self.handle_connection_lost(&cause);
            }
            TransportEvent::ConnectionLost { cause } => {
                debug!(generation = tagged.generation, %cause, "Ignoring loss from discarded client");
            }
            TransportEvent::MessageArrived { topic, payload } => {
                if let Some(callback) = self.callbacks().message {
                    callback(&topic, &payload);
                }
            }
            TransportEvent::DeliveryComplete(token) => {
                if let Some(callback) = self.callbacks().delivery_complete {
                    callback(token);
                }
            }
        }
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
    }
}
