//! Broker monitor probe tests
//!
//! Tests how probe outcomes flow into the registry:
//! - latency and bandwidth failures take a broker out of rotation
//! - connection-count failures keep the previous metric and availability
//! - a successful probe brings an unavailable broker back


use adaptive_publisher::broker::{BrokerRegistry, WeightTable};
use adaptive_publisher::monitor::{
    BrokerMonitor, BrokerProber, MonitorEvent, ProbeError, ProbeKind, MONITOR_EVENT_CAPACITY,
};
use adaptive_publisher::testing::{BrokerScript, MockTransportFactory};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{eventually, fast_probes, latency_only_monitor, X, Y};
use tokio::sync::mpsc;

fn monitored(
    brokers: &[&str],
) -> (
    Arc<BrokerRegistry>,
    MockTransportFactory,
    BrokerMonitor,
    mpsc::Receiver<MonitorEvent>,
) {
    let registry = Arc::new(BrokerRegistry::new("sensor", &WeightTable::builtin()));
    registry.replace_all(brokers);
    let factory = MockTransportFactory::new();
    let (monitor, events) = BrokerMonitor::new(
        registry.clone(),
        Arc::new(factory.clone()),
        latency_only_monitor(),
    );
    (registry, factory, monitor, events)
}

#[tokio::test]
async fn test_connection_count_timeout_is_not_fatal() {
    // Arrange: the broker never answers on its statistics topic
    let (registry, factory, monitor, _events) = monitored(&[X]);
    factory.script(X, BrokerScript::default());
    registry.update_metrics(X, 20.0, 1_500_000.0, 42);

    // Act
    monitor.run_probe(ProbeKind::ConnectionCount, X).await;

    // Assert
    let record = registry.get(X).unwrap();
    assert!(record.available);
    assert_eq!(record.connection_count, 42);
    assert_eq!(record.latency, 20.0);
}

#[tokio::test]
async fn test_connection_count_garbage_is_not_fatal() {
    let (registry, factory, monitor, _events) = monitored(&[X]);
    factory.script(X, BrokerScript::default().with_stats_reply("lots"));
    registry.update_metrics(X, 20.0, 1_500_000.0, 7);

    monitor.run_probe(ProbeKind::ConnectionCount, X).await;

    let record = registry.get(X).unwrap();
    assert!(record.available);
    assert_eq!(record.connection_count, 7);
}

#[tokio::test]
async fn test_connection_count_reply_updates_metric() {
    let (registry, factory, monitor, mut events) = monitored(&[X]);
    factory.script(X, BrokerScript::default().with_stats_reply(" 17 "));
    registry.update_metrics(X, 20.0, 1_500_000.0, 0);

    monitor.run_probe(ProbeKind::ConnectionCount, X).await;

    let record = registry.get(X).unwrap();
    assert_eq!(record.connection_count, 17);
    assert_eq!(record.bandwidth, 1_500_000.0);
    assert!(matches!(
        events.try_recv(),
        Ok(MonitorEvent::MetricsUpdated { connection_count: 17, .. })
    ));
}

#[tokio::test]
async fn test_bandwidth_timeout_marks_unavailable() {
    let (registry, factory, monitor, _events) = monitored(&[X]);
    factory.script(X, BrokerScript::default().without_delivery_acks());
    registry.update_metrics(X, 20.0, 1_500_000.0, 5);

    monitor.run_probe(ProbeKind::Bandwidth, X).await;

    let record = registry.get(X).unwrap();
    assert!(!record.available);
    assert_eq!(record.score, 0.0);
}

#[tokio::test]
async fn test_refused_probe_connection_marks_unavailable() {
    let (registry, factory, monitor, _events) = monitored(&[X]);
    factory.script(X, BrokerScript::refusing());

    monitor.run_probe(ProbeKind::Latency, X).await;

    assert!(!registry.is_available(X));
}

#[tokio::test]
async fn test_latency_probe_recovers_unavailable_broker() {
    let (registry, factory, monitor, _events) = monitored(&[X]);
    factory.script(X, BrokerScript::default());
    registry.mark_unavailable(X);

    monitor.run_probe(ProbeKind::Latency, X).await;

    let record = registry.get(X).unwrap();
    assert!(record.available);
    assert!(record.latency > 0.0);
    assert!(record.score > 0.0);
}

#[tokio::test]
async fn test_background_monitor_recommends_better_broker() {
    let (registry, factory, monitor, mut events) = monitored(&[X, Y]);
    factory.script(X, BrokerScript::default().without_echo());
    registry.set_current(X);

    monitor.start();
    let recommended = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let MonitorEvent::SwitchRecommended { uri } = event {
                return Some(uri);
            }
        }
        None
    })
    .await
    .unwrap();
    monitor.stop().await;

    assert_eq!(recommended.as_deref(), Some(Y));
    assert!(!registry.is_available(X));
    assert!(!monitor.is_running());
}

#[tokio::test]
async fn test_probes_use_fresh_client_per_measurement() {
    let factory = MockTransportFactory::new();
    factory.script(X, BrokerScript::default().with_stats_reply("3"));
    let prober = BrokerProber::new(Arc::new(factory.clone()), fast_probes());

    assert!(prober.measure_latency(X).await.unwrap() >= 0.0);
    assert!(prober.measure_bandwidth(X).await.unwrap() > 0.0);
    assert_eq!(prober.fetch_connection_count(X).await.unwrap(), 3);

    let client_ids = factory.client_ids(X);
    assert_eq!(client_ids.len(), 3);
    assert!(client_ids.iter().all(|id| id.starts_with("monitor_")));
    assert!(eventually(|| factory.open_connections(X) == 0).await);
    assert!(factory
        .subscriptions(X)
        .iter()
        .any(|s| s.filter.starts_with("$SYS/brokers/")));
}

#[tokio::test]
async fn test_probe_errors_name_the_probe() {
    let factory = MockTransportFactory::new();
    factory.script(X, BrokerScript::default().without_echo());
    let prober = BrokerProber::new(Arc::new(factory), fast_probes());

    let error = prober.measure_latency(X).await.unwrap_err();
    assert!(matches!(
        error,
        ProbeError::Timeout {
            probe: ProbeKind::Latency,
            ..
        }
    ));
}

#[tokio::test]
async fn test_switch_recommendation_survives_slow_receiver() {
    // Arrange: metric updates for the current broker fill the channel
    let (registry, factory, monitor, mut events) = monitored(&[X, Y]);
    let monitor = Arc::new(monitor);
    registry.set_current(X);
    for _ in 0..MONITOR_EVENT_CAPACITY + 4 {
        monitor.run_probe(ProbeKind::Latency, X).await;
    }
    assert!(!registry.should_switch());

    // X degrades and Y is measured while the receiver is still behind
    factory.script(X, BrokerScript::default().without_echo());
    monitor.run_probe(ProbeKind::Latency, X).await;
    assert!(!registry.is_available(X));
    let pending = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run_probe(ProbeKind::Latency, Y).await })
    };

    // Act: the receiver catches up
    let recommended = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let MonitorEvent::SwitchRecommended { uri } = event {
                return Some(uri);
            }
        }
        None
    })
    .await
    .unwrap();

    // Assert
    assert_eq!(recommended.as_deref(), Some(Y));
    tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
}
