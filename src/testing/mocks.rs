//! Mock transport for testing
//!
//! [`MockTransportFactory`] hands out in-memory clients whose behaviour is
//! scripted per broker URI: accept, refuse or hang on connect, fail publishes,
//! echo messages back to matching subscriptions, confirm deliveries and answer
//! `$SYS` statistics subscriptions. Every call is recorded for assertions.

use crate::transport::{
    DeliveryToken, EventSink, QoS, TokenGenerator, TransportClient, TransportError,
    TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What a mock broker does with a connect request
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    Accept,
    Refuse(String),
    /// Never answer; the attempt runs into its timeout
    Hang,
}

/// Scripted behaviour of one mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerScript {
    pub connect: ConnectBehavior,
    pub publish_fails: bool,
    pub subscribe_fails: bool,
    /// Deliver published messages back to matching subscriptions
    pub echo: bool,
    pub echo_delay: Duration,
    pub ack_deliveries: bool,
    /// Payload answered on `$SYS` subscriptions
    pub stats_reply: Option<String>,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Accept,
            publish_fails: false,
            subscribe_fails: false,
            echo: true,
            echo_delay: Duration::ZERO,
            ack_deliveries: true,
            stats_reply: None,
        }
    }
}

impl BrokerScript {
    pub fn refusing() -> Self {
        Self {
            connect: ConnectBehavior::Refuse("connection refused".to_string()),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            connect: ConnectBehavior::Hang,
            ..Default::default()
        }
    }

    pub fn failing_publishes(mut self) -> Self {
        self.publish_fails = true;
        self
    }

    pub fn failing_subscribes(mut self) -> Self {
        self.subscribe_fails = true;
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn with_echo_delay(mut self, delay: Duration) -> Self {
        self.echo_delay = delay;
        self
    }

    pub fn without_delivery_acks(mut self) -> Self {
        self.ack_deliveries = false;
        self
    }

    pub fn with_stats_reply(mut self, payload: impl Into<String>) -> Self {
        self.stats_reply = Some(payload.into());
        self
    }
}

/// A message accepted by a mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub broker: String,
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// A subscription accepted by a mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSubscription {
    pub broker: String,
    pub filter: String,
    pub qos: QoS,
}

struct LiveConnection {
    id: u64,
    broker: String,
    events: EventSink,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, BrokerScript>,
    connect_attempts: Vec<String>,
    client_ids: HashMap<String, Vec<String>>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<RecordedSubscription>,
    unsubscriptions: Vec<(String, String)>,
    disconnects: Vec<String>,
    live: Vec<LiveConnection>,
    next_id: u64,
}

impl MockState {
    fn script(&self, broker: &str) -> BrokerScript {
        self.scripts.get(broker).cloned().unwrap_or_default()
    }

    fn close(&mut self, id: u64) {
        self.live.retain(|conn| conn.id != id);
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Factory of scripted in-memory transport clients
#[derive(Default, Clone)]
pub struct MockTransportFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the behaviour of one broker; unscripted brokers accept
    pub fn script(&self, broker_uri: &str, script: BrokerScript) {
        lock(&self.state)
            .scripts
            .insert(broker_uri.to_string(), script);
    }

    /// Broker URIs of every connect attempt, in order
    pub fn connect_attempts(&self) -> Vec<String> {
        lock(&self.state).connect_attempts.clone()
    }

    pub fn client_ids(&self, broker_uri: &str) -> Vec<String> {
        lock(&self.state)
            .client_ids
            .get(broker_uri)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_to(&self, broker_uri: &str) -> Vec<PublishedMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.broker == broker_uri)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self, broker_uri: &str) -> Vec<RecordedSubscription> {
        lock(&self.state)
            .subscriptions
            .iter()
            .filter(|s| s.broker == broker_uri)
            .cloned()
            .collect()
    }

    /// (broker, filter) of every unsubscribe
    pub fn unsubscriptions(&self) -> Vec<(String, String)> {
        lock(&self.state).unsubscriptions.clone()
    }

    /// Broker URIs of every clean disconnect, in order
    pub fn disconnects(&self) -> Vec<String> {
        lock(&self.state).disconnects.clone()
    }

    pub fn open_connections(&self, broker_uri: &str) -> usize {
        lock(&self.state)
            .live
            .iter()
            .filter(|c| c.broker == broker_uri)
            .count()
    }

    /// Sever every open connection to a broker, reporting the loss to clients
    pub fn drop_connection(&self, broker_uri: &str, cause: &str) -> usize {
        let mut state = lock(&self.state);
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.live)
            .into_iter()
            .partition(|c| c.broker == broker_uri);
        state.live = kept;
        drop(state);

        for conn in &dropped {
            conn.connected.store(false, Ordering::SeqCst);
            conn.events.emit(TransportEvent::ConnectionLost {
                cause: cause.to_string(),
            });
        }
        dropped.len()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        broker_uri: &str,
        client_id: &str,
        events: EventSink,
    ) -> Result<Box<dyn TransportClient>, TransportError> {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            state
                .client_ids
                .entry(broker_uri.to_string())
                .or_default()
                .push(client_id.to_string());
            state.next_id
        };

        Ok(Box::new(MockTransport {
            id,
            broker_uri: broker_uri.to_string(),
            client_id: client_id.to_string(),
            events,
            state: self.state.clone(),
            tokens: TokenGenerator::default(),
            connected: Arc::new(AtomicBool::new(false)),
            filters: Mutex::new(Vec::new()),
        }))
    }
}

/// In-memory client created by [`MockTransportFactory`]
pub struct MockTransport {
    id: u64,
    broker_uri: String,
    client_id: String,
    events: EventSink,
    state: Arc<Mutex<MockState>>,
    tokens: TokenGenerator,
    connected: Arc<AtomicBool>,
    filters: Mutex<Vec<String>>,
}

impl MockTransport {
    fn script(&self) -> BrokerScript {
        lock(&self.state).script(&self.broker_uri)
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn filters(&self) -> MutexGuard<'_, Vec<String>> {
        self.filters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, topic: String, payload: Bytes, delay: Duration) {
        let event = TransportEvent::MessageArrived { topic, payload };
        if delay.is_zero() {
            self.events.emit(event);
        } else {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                events.emit(event);
            });
        }
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        let script = {
            let mut state = lock(&self.state);
            state.connect_attempts.push(self.broker_uri.clone());
            state.script(&self.broker_uri)
        };

        match script.connect {
            ConnectBehavior::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                lock(&self.state).live.push(LiveConnection {
                    id: self.id,
                    broker: self.broker_uri.clone(),
                    events: self.events.clone(),
                    connected: self.connected.clone(),
                });
                self.events.emit(TransportEvent::Connected);
                Ok(())
            }
            ConnectBehavior::Refuse(reason) => Err(TransportError::ConnectionRefused {
                uri: self.broker_uri.clone(),
                reason,
            }),
            ConnectBehavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::ConnectTimeout {
                    uri: self.broker_uri.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn disconnect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        self.check_connected()?;
        self.connected.store(false, Ordering::SeqCst);

        let mut state = lock(&self.state);
        state.close(self.id);
        state.disconnects.push(self.broker_uri.clone());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<DeliveryToken, TransportError> {
        self.check_connected()?;
        let script = self.script();
        if script.publish_fails {
            return Err(TransportError::PublishFailed(format!(
                "mock broker {} rejected publish",
                self.broker_uri
            )));
        }

        lock(&self.state).published.push(PublishedMessage {
            broker: self.broker_uri.clone(),
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retained,
        });

        let token = self.tokens.next();
        if script.ack_deliveries {
            self.events.emit(TransportEvent::DeliveryComplete(token));
        }

        let echoed = script.echo && self.filters().iter().any(|f| topic_matches(f, topic));
        if echoed {
            self.deliver(topic.to_string(), payload, script.echo_delay);
        }

        Ok(token)
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.check_connected()?;
        let script = self.script();
        if script.subscribe_fails {
            return Err(TransportError::SubscribeFailed(topic_filter.to_string()));
        }

        lock(&self.state).subscriptions.push(RecordedSubscription {
            broker: self.broker_uri.clone(),
            filter: topic_filter.to_string(),
            qos,
        });
        self.filters().push(topic_filter.to_string());

        if let (true, Some(reply)) = (topic_filter.starts_with("$SYS"), script.stats_reply) {
            let topic = topic_filter.replace('+', "mock").replace('#', "count");
            self.deliver(topic, Bytes::from(reply), script.echo_delay);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        lock(&self.state)
            .unsubscriptions
            .push((self.broker_uri.clone(), topic_filter.to_string()));
        self.filters().retain(|f| f != topic_filter);
        Ok(())
    }

    fn broker_uri(&self) -> &str {
        &self.broker_uri
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        lock(&self.state).close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "mqtt://mock:1883";

    use crate::transport::TaggedEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn create(
        factory: &MockTransportFactory,
    ) -> (Box<dyn TransportClient>, UnboundedReceiver<TaggedEvent>) {
        let (events, rx) = EventSink::standalone();
        (factory.create(URI, "tester", events).unwrap(), rx)
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("test/latency", "test/latency"));
        assert!(topic_matches(
            "$SYS/brokers/+/stats/connections/count",
            "$SYS/brokers/node1/stats/connections/count"
        ));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[tokio::test]
    async fn test_accepting_broker_echoes_and_acks() {
        let factory = MockTransportFactory::new();
        let (mut client, mut rx) = create(&factory);

        client.connect(Duration::from_millis(10)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, TransportEvent::Connected);
        assert_eq!(factory.open_connections(URI), 1);

        client.subscribe("echo/#", QoS::AtLeastOnce).await.unwrap();
        let token = client
            .publish("echo/1", Bytes::from_static(b"hi"), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap().event,
            TransportEvent::DeliveryComplete(token)
        );
        assert_eq!(
            rx.recv().await.unwrap().event,
            TransportEvent::MessageArrived {
                topic: "echo/1".to_string(),
                payload: Bytes::from_static(b"hi")
            }
        );

        client.disconnect(Duration::from_millis(10)).await.unwrap();
        assert_eq!(factory.open_connections(URI), 0);
        assert_eq!(factory.disconnects(), vec![URI.to_string()]);
    }

    #[tokio::test]
    async fn test_refusing_broker() {
        let factory = MockTransportFactory::new();
        factory.script(URI, BrokerScript::refusing());
        let (mut client, _rx) = create(&factory);

        assert!(matches!(
            client.connect(Duration::from_millis(10)).await,
            Err(TransportError::ConnectionRefused { .. })
        ));
        assert_eq!(factory.connect_attempts(), vec![URI.to_string()]);
        assert!(matches!(
            client
                .publish("t", Bytes::new(), QoS::AtMostOnce, false)
                .await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_hanging_broker_times_out() {
        let factory = MockTransportFactory::new();
        factory.script(URI, BrokerScript::hanging());
        let (mut client, _rx) = create(&factory);

        assert!(matches!(
            client.connect(Duration::from_millis(20)).await,
            Err(TransportError::ConnectTimeout { timeout_ms: 20, .. })
        ));
    }

    #[tokio::test]
    async fn test_drop_connection_reports_loss() {
        let factory = MockTransportFactory::new();
        let (mut client, mut rx) = create(&factory);
        client.connect(Duration::from_millis(10)).await.unwrap();
        let _ = rx.recv().await;

        assert_eq!(factory.drop_connection(URI, "network down"), 1);
        assert_eq!(
            rx.recv().await.unwrap().event,
            TransportEvent::ConnectionLost {
                cause: "network down".to_string()
            }
        );
        assert!(matches!(
            client.subscribe("t", QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_stats_reply_on_sys_subscription() {
        let factory = MockTransportFactory::new();
        factory.script(URI, BrokerScript::default().with_stats_reply("5"));
        let (mut client, mut rx) = create(&factory);
        client.connect(Duration::from_millis(10)).await.unwrap();
        let _ = rx.recv().await;

        client
            .subscribe("$SYS/brokers/+/stats/connections/count", QoS::AtLeastOnce)
            .await
            .unwrap();
        match rx.recv().await.unwrap().event {
            TransportEvent::MessageArrived { topic, payload } => {
                assert_eq!(topic, "$SYS/brokers/mock/stats/connections/count");
                assert_eq!(payload, Bytes::from_static(b"5"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
