//! The adaptive publisher: registry, monitor and orchestrator wired together
//!
//! [`AdaptivePublisher`] is the surface applications use. It owns the broker
//! registry, runs the [`BrokerMonitor`] on demand, and forwards the monitor's
//! switch recommendations to the [`ConnectionOrchestrator`].

use crate::broker::{BrokerRecord, BrokerRegistry, WeightTable};
use crate::config::{ConfigError, PublisherConfig};
use crate::error::PublisherResult;
use crate::monitor::{BrokerMonitor, MonitorConfig, MonitorEvent};
use crate::orchestrator::{
    ConnectedCallback, ConnectionLostCallback, ConnectionOrchestrator, ConnectionState,
    DeliveryCallback, MessageCallback, OrchestratorConfig,
};
use crate::transport::mqtt::RumqttTransportFactory;
use crate::transport::{DeliveryToken, QoS, TransportFactory};
use bytes::Bytes;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Invoked with the broker's fresh snapshot after every successful probe
pub type MetricsCallback = Arc<dyn Fn(&BrokerRecord) + Send + Sync>;

/// Everything needed to assemble a publisher besides the transports
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub category: String,
    pub weights: WeightTable,
    pub monitor: MonitorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            category: crate::broker::DEFAULT_CATEGORY.to_string(),
            weights: WeightTable::builtin(),
            monitor: MonitorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl PublisherSettings {
    pub fn for_category(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Self::default()
        }
    }
}

type SharedMetricsCallback = Arc<RwLock<Option<MetricsCallback>>>;

/// Self-adaptive publisher over a set of candidate brokers
pub struct AdaptivePublisher {
    registry: Arc<BrokerRegistry>,
    monitor: BrokerMonitor,
    orchestrator: Arc<ConnectionOrchestrator>,
    metrics_callback: SharedMetricsCallback,
    router: JoinHandle<()>,
}

impl AdaptivePublisher {
    /// Publisher whose connections and probes share one transport factory
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: PublisherSettings, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_factories(settings, factory.clone(), factory)
    }

    /// Publisher with separate factories for the live connection and for
    /// monitor probes
    pub fn with_factories(
        settings: PublisherSettings,
        connection_factory: Arc<dyn TransportFactory>,
        probe_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let registry = Arc::new(BrokerRegistry::new(&settings.category, &settings.weights));
        let orchestrator = ConnectionOrchestrator::new(
            registry.clone(),
            connection_factory,
            settings.orchestrator,
        );
        let (monitor, events) = BrokerMonitor::new(registry.clone(), probe_factory, settings.monitor);

        let metrics_callback: SharedMetricsCallback = Arc::new(RwLock::new(None));
        let router = tokio::spawn(route_monitor_events(
            events,
            Arc::downgrade(&orchestrator),
            registry.clone(),
            metrics_callback.clone(),
        ));

        info!(
            category = %registry.category(),
            weights = ?registry.weights(),
            "Adaptive publisher created"
        );

        Self {
            registry,
            monitor,
            orchestrator,
            metrics_callback,
            router,
        }
    }

    /// Build an MQTT publisher from configuration, registering its brokers
    ///
    /// Probe clients carry no last will; orchestrator clients do when one is
    /// configured.
    pub fn from_config(config: &PublisherConfig) -> PublisherResult<Self> {
        config.validate()?;
        if config.mqtt.brokers.is_empty() {
            return Err(
                ConfigError::InvalidConfig("mqtt.brokers must not be empty".to_string()).into(),
            );
        }
        let monitor = config.monitor_config()?;
        let settings = PublisherSettings {
            category: config.publisher.category.clone(),
            weights: config.weight_table(),
            monitor,
            orchestrator: config.orchestrator_config(),
        };

        let probe_factory = RumqttTransportFactory::new(config.mqtt.clone());
        let connection_factory = match config.will_message() {
            Some(will) => probe_factory.clone().with_will(will),
            None => probe_factory.clone(),
        };

        let publisher =
            Self::with_factories(settings, Arc::new(connection_factory), Arc::new(probe_factory));
        publisher.set_brokers(&config.mqtt.brokers);
        Ok(publisher)
    }

    pub fn category(&self) -> &str {
        self.registry.category()
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub fn add_broker(&self, uri: &str) {
        self.registry.add(uri);
    }

    pub fn remove_broker(&self, uri: &str) {
        self.registry.remove(uri);
    }

    /// Replace the broker list in one step
    pub fn set_brokers<S: AsRef<str>>(&self, uris: &[S]) {
        self.registry.replace_all(uris);
    }

    pub async fn connect(&self) -> bool {
        self.orchestrator.connect().await
    }

    pub async fn disconnect(&self) {
        self.orchestrator.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.orchestrator.is_connected()
    }

    /// `None` means the message was queued for the next connection
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Option<DeliveryToken> {
        self.orchestrator.publish(topic, payload, qos, retained).await
    }

    pub async fn subscribe(&self, topic_filter: &str, qos: QoS) -> PublisherResult<()> {
        self.orchestrator.subscribe(topic_filter, qos).await
    }

    pub async fn unsubscribe(&self, topic_filter: &str) -> PublisherResult<()> {
        self.orchestrator.unsubscribe(topic_filter).await
    }

    /// Snapshot of every registered broker, in registry order
    pub fn broker_stats(&self) -> Vec<BrokerRecord> {
        self.registry.list_all()
    }

    /// Empty when no broker has been selected yet
    pub fn current_broker_uri(&self) -> String {
        self.registry.current_uri()
    }

    pub fn queued_message_count(&self) -> usize {
        self.orchestrator.queued_message_count()
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub async fn stop_monitoring(&self) {
        self.monitor.stop().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn state(&self) -> ConnectionState {
        self.orchestrator.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.orchestrator.state_receiver()
    }

    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        self.orchestrator.set_connected_callback(callback);
    }

    pub fn set_connection_lost_callback(&self, callback: ConnectionLostCallback) {
        self.orchestrator.set_connection_lost_callback(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.orchestrator.set_message_callback(callback);
    }

    pub fn set_delivery_complete_callback(&self, callback: DeliveryCallback) {
        self.orchestrator.set_delivery_complete_callback(callback);
    }

    pub fn set_metrics_updated_callback(&self, callback: MetricsCallback) {
        *self
            .metrics_callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    /// Stop monitoring, then close the broker connection
    pub async fn shutdown(&self) {
        info!("Shutting down adaptive publisher");
        self.stop_monitoring().await;
        self.disconnect().await;
    }
}

impl Drop for AdaptivePublisher {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Forward monitor notifications until the monitor's sender goes away
async fn route_monitor_events(
    mut events: mpsc::Receiver<MonitorEvent>,
    orchestrator: Weak<ConnectionOrchestrator>,
    registry: Arc<BrokerRegistry>,
    metrics_callback: SharedMetricsCallback,
) {
    while let Some(event) = events.recv().await {
        match event {
            MonitorEvent::MetricsUpdated { uri, .. } => {
                let callback = metrics_callback
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if let (Some(callback), Some(record)) = (callback, registry.get(&uri)) {
                    callback(&record);
                }
            }
            MonitorEvent::SwitchRecommended { uri } => {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                // Failover can take seconds; keep draining metrics meanwhile
                tokio::spawn(async move {
                    orchestrator.handle_switch_recommendation(&uri).await;
                });
            }
        }
    }
    debug!("Monitor event router stopped");
}
