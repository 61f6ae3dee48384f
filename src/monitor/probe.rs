//! Broker measurements over transient transport connections
//!
//! Every probe opens its own client with a fresh client id, runs one test and
//! disconnects. Clients are never reused between probes.

use super::schedule::ProbeKind;
use crate::transport::{
    EventSink, QoS, TaggedEvent, TransportClient, TransportError, TransportEvent,
    TransportFactory,
};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use uuid::Uuid;

/// Probe timings, topics and burst shape
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Prefix of the per-probe client id
    pub client_id_prefix: String,
    pub connect_timeout: Duration,
    pub latency_timeout: Duration,
    pub bandwidth_timeout: Duration,
    pub connection_count_timeout: Duration,
    pub qos: QoS,
    pub latency_topic: String,
    pub bandwidth_topic: String,
    pub connection_count_topic: String,
    pub bandwidth_message_count: usize,
    pub bandwidth_message_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "monitor".to_string(),
            connect_timeout: Duration::from_secs(5),
            latency_timeout: Duration::from_secs(5),
            bandwidth_timeout: Duration::from_secs(10),
            connection_count_timeout: Duration::from_secs(5),
            qos: QoS::AtLeastOnce,
            latency_topic: "test/latency".to_string(),
            bandwidth_topic: "test/bandwidth".to_string(),
            connection_count_topic: "$SYS/brokers/+/stats/connections/count".to_string(),
            bandwidth_message_count: 10,
            bandwidth_message_size: 1024,
        }
    }
}

/// Probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe connection failed: {0}")]
    Connect(TransportError),
    #[error("Probe transport error: {0}")]
    Transport(TransportError),
    #[error("{probe} probe timed out after {timeout_ms}ms")]
    Timeout { probe: ProbeKind, timeout_ms: u64 },
    #[error("Probe connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid connection count payload: {0:?}")]
    InvalidConnectionCount(String),
    #[error("Probe event channel closed")]
    EventChannelClosed,
}

/// Bandwidth in bytes per second; elapsed time is clamped to at least 1 ms
pub fn bandwidth_from_elapsed(total_bytes: usize, elapsed: Duration) -> f64 {
    let elapsed_ms = elapsed.as_millis().max(1) as f64;
    total_bytes as f64 * 1000.0 / elapsed_ms
}

/// Parse a `$SYS` connection-count payload
pub fn parse_connection_count(payload: &[u8]) -> Result<u32, ProbeError> {
    let text = String::from_utf8_lossy(payload);
    text.trim()
        .parse::<u32>()
        .map_err(|_| ProbeError::InvalidConnectionCount(text.to_string()))
}

/// Runs latency, bandwidth and connection-count tests against one broker
pub struct BrokerProber {
    factory: Arc<dyn TransportFactory>,
    config: ProbeConfig,
}

impl BrokerProber {
    pub fn new(factory: Arc<dyn TransportFactory>, config: ProbeConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    async fn open(
        &self,
        broker_uri: &str,
    ) -> Result<(Box<dyn TransportClient>, UnboundedReceiver<TaggedEvent>), ProbeError> {
        let (events, rx) = EventSink::standalone();
        let client_id = format!(
            "{}_{}",
            self.config.client_id_prefix,
            Uuid::new_v4().simple()
        );
        let mut client = self
            .factory
            .create(broker_uri, &client_id, events)
            .map_err(ProbeError::Connect)?;
        client
            .connect(self.config.connect_timeout)
            .await
            .map_err(ProbeError::Connect)?;
        Ok((client, rx))
    }

    async fn close(&self, mut client: Box<dyn TransportClient>) {
        if let Err(e) = client.disconnect(self.config.connect_timeout).await {
            debug!(broker = %client.broker_uri(), error = %e, "Probe disconnect failed");
        }
    }

    /// Wait for the first event `accept` maps to a value
    async fn await_event<T>(
        events: &mut UnboundedReceiver<TaggedEvent>,
        probe: ProbeKind,
        timeout: Duration,
        mut accept: impl FnMut(TransportEvent) -> Option<T>,
    ) -> Result<T, ProbeError> {
        let waited = tokio::time::timeout(timeout, async {
            while let Some(tagged) = events.recv().await {
                if let TransportEvent::ConnectionLost { cause } = &tagged.event {
                    return Err(ProbeError::ConnectionLost(cause.clone()));
                }
                if let Some(value) = accept(tagged.event) {
                    return Ok(value);
                }
            }
            Err(ProbeError::EventChannelClosed)
        })
        .await;

        waited.unwrap_or_else(|_| {
            Err(ProbeError::Timeout {
                probe,
                timeout_ms: timeout.as_millis() as u64,
            })
        })
    }

    /// Round-trip time in milliseconds of one message through the broker
    pub async fn measure_latency(&self, broker_uri: &str) -> Result<f64, ProbeError> {
        let (client, mut events) = self.open(broker_uri).await?;
        let result = self.latency_round_trip(client.as_ref(), &mut events).await;
        self.close(client).await;
        result
    }

    async fn latency_round_trip(
        &self,
        client: &dyn TransportClient,
        events: &mut UnboundedReceiver<TaggedEvent>,
    ) -> Result<f64, ProbeError> {
        let topic = &self.config.latency_topic;
        client
            .subscribe(topic, self.config.qos)
            .await
            .map_err(ProbeError::Transport)?;

        let payload = Bytes::from(format!(
            "latency_test:{}",
            chrono::Utc::now().timestamp_millis()
        ));
        let sent_at = Instant::now();
        client
            .publish(topic, payload.clone(), self.config.qos, false)
            .await
            .map_err(ProbeError::Transport)?;

        let round_trip = Self::await_event(
            events,
            ProbeKind::Latency,
            self.config.latency_timeout,
            |event| match event {
                TransportEvent::MessageArrived {
                    topic: arrived,
                    payload: echoed,
                } if &arrived == topic && echoed == payload => Some(sent_at.elapsed()),
                _ => None,
            },
        )
        .await?;

        Ok(round_trip.as_secs_f64() * 1000.0)
    }

    /// Throughput in bytes per second of a burst of fixed-size messages,
    /// measured until the last delivery confirmation
    pub async fn measure_bandwidth(&self, broker_uri: &str) -> Result<f64, ProbeError> {
        let (client, mut events) = self.open(broker_uri).await?;
        let result = self.bandwidth_burst(client.as_ref(), &mut events).await;
        self.close(client).await;
        result
    }

    async fn bandwidth_burst(
        &self,
        client: &dyn TransportClient,
        events: &mut UnboundedReceiver<TaggedEvent>,
    ) -> Result<f64, ProbeError> {
        let message = Bytes::from(vec![b'A'; self.config.bandwidth_message_size]);
        let started = Instant::now();

        let mut outstanding = HashSet::with_capacity(self.config.bandwidth_message_count);
        for _ in 0..self.config.bandwidth_message_count {
            let token = client
                .publish(
                    &self.config.bandwidth_topic,
                    message.clone(),
                    self.config.qos,
                    false,
                )
                .await
                .map_err(ProbeError::Transport)?;
            outstanding.insert(token);
        }

        let elapsed = Self::await_event(
            events,
            ProbeKind::Bandwidth,
            self.config.bandwidth_timeout,
            |event| {
                if let TransportEvent::DeliveryComplete(token) = event {
                    outstanding.remove(&token);
                }
                outstanding.is_empty().then(|| started.elapsed())
            },
        )
        .await?;

        let total_bytes = self.config.bandwidth_message_size * self.config.bandwidth_message_count;
        Ok(bandwidth_from_elapsed(total_bytes, elapsed))
    }

    /// Client count reported on the broker's statistics topic
    pub async fn fetch_connection_count(&self, broker_uri: &str) -> Result<u32, ProbeError> {
        let (client, mut events) = self.open(broker_uri).await?;
        let result = self.read_connection_count(client.as_ref(), &mut events).await;
        self.close(client).await;
        result
    }

    async fn read_connection_count(
        &self,
        client: &dyn TransportClient,
        events: &mut UnboundedReceiver<TaggedEvent>,
    ) -> Result<u32, ProbeError> {
        client
            .subscribe(&self.config.connection_count_topic, self.config.qos)
            .await
            .map_err(ProbeError::Transport)?;

        let payload = Self::await_event(
            events,
            ProbeKind::ConnectionCount,
            self.config.connection_count_timeout,
            |event| match event {
                TransportEvent::MessageArrived { payload, .. } => Some(payload),
                _ => None,
            },
        )
        .await?;

        parse_connection_count(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{BrokerScript, MockTransportFactory};

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            connect_timeout: Duration::from_millis(100),
            latency_timeout: Duration::from_millis(100),
            bandwidth_timeout: Duration::from_millis(100),
            connection_count_timeout: Duration::from_millis(100),
            ..ProbeConfig::default()
        }
    }

    fn prober(factory: &Arc<MockTransportFactory>) -> BrokerProber {
        BrokerProber::new(factory.clone(), fast_config())
    }

    const URI: &str = "mqtt://probe-target:1883";

    #[test]
    fn test_bandwidth_from_elapsed() {
        assert_eq!(bandwidth_from_elapsed(10_240, Duration::from_millis(10)), 1_024_000.0);
        // Sub-millisecond bursts are clamped to 1 ms
        assert_eq!(bandwidth_from_elapsed(10_240, Duration::ZERO), 10_240_000.0);
    }

    #[test]
    fn test_parse_connection_count() {
        assert_eq!(parse_connection_count(b"42").unwrap(), 42);
        assert_eq!(parse_connection_count(b" 7\n").unwrap(), 7);
        assert!(matches!(
            parse_connection_count(b"many"),
            Err(ProbeError::InvalidConnectionCount(_))
        ));
        assert!(parse_connection_count(b"-1").is_err());
    }

    #[tokio::test]
    async fn test_latency_probe_measures_echo() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default().with_echo_delay(Duration::from_millis(20)));

        let latency = prober(&factory).measure_latency(URI).await.unwrap();
        assert!(latency >= 20.0, "latency {latency}");
        assert!(latency < 100.0, "latency {latency}");

        let published = factory.published_to(URI);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "test/latency");
        assert!(String::from_utf8_lossy(&published[0].payload).starts_with("latency_test:"));
        assert!(factory.client_ids(URI)[0].starts_with("monitor_"));
    }

    #[tokio::test]
    async fn test_latency_probe_times_out_without_echo() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default().without_echo());

        let result = prober(&factory).measure_latency(URI).await;
        assert!(matches!(
            result,
            Err(ProbeError::Timeout {
                probe: ProbeKind::Latency,
                ..
            })
        ));
        // The transient client is torn down even on failure
        assert_eq!(factory.open_connections(URI), 0);
    }

    #[tokio::test]
    async fn test_probe_connect_failure() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::refusing());

        let result = prober(&factory).measure_bandwidth(URI).await;
        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }

    #[tokio::test]
    async fn test_bandwidth_probe_counts_burst() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default());

        let bandwidth = prober(&factory).measure_bandwidth(URI).await.unwrap();
        assert!(bandwidth > 0.0);
        assert!(bandwidth <= 10_240_000.0);

        let published = factory.published_to(URI);
        assert_eq!(published.len(), 10);
        assert!(published
            .iter()
            .all(|m| m.topic == "test/bandwidth" && m.payload.len() == 1024));
        assert!(published[0].payload.iter().all(|b| *b == b'A'));
    }

    #[tokio::test]
    async fn test_bandwidth_probe_times_out_without_acks() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default().without_delivery_acks());

        let result = prober(&factory).measure_bandwidth(URI).await;
        assert!(matches!(
            result,
            Err(ProbeError::Timeout {
                probe: ProbeKind::Bandwidth,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_count_probe() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default().with_stats_reply("17"));

        let count = prober(&factory).fetch_connection_count(URI).await.unwrap();
        assert_eq!(count, 17);
    }

    #[tokio::test]
    async fn test_connection_count_probe_without_stats() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default());

        let result = prober(&factory).fetch_connection_count(URI).await;
        assert!(matches!(
            result,
            Err(ProbeError::Timeout {
                probe: ProbeKind::ConnectionCount,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_count_probe_bad_payload() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.script(URI, BrokerScript::default().with_stats_reply("n/a"));

        let result = prober(&factory).fetch_connection_count(URI).await;
        assert!(matches!(result, Err(ProbeError::InvalidConnectionCount(_))));
    }
}
