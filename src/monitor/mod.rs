//! Background broker monitoring
//!
//! [`BrokerMonitor`] runs one spawned task that wakes on a coarse tick, runs
//! whichever probe cadences are due against every registered broker, and
//! writes the results into the [`BrokerRegistry`]. Metric updates and switch
//! recommendations are sent to the owner over a bounded channel. Metric
//! updates are dropped while the channel is full; a switch recommendation
//! waits for room until the monitor is stopped.
//!
//! Failure handling per probe kind:
//!
//! - latency / bandwidth failure: the broker is marked unavailable
//! - connection-count failure: logged, metrics left untouched
//!
//! A successful latency or bandwidth probe on an unavailable broker marks it
//! available again before the new metrics are written.

pub mod probe;
pub mod schedule;

pub use probe::{BrokerProber, ProbeConfig, ProbeError};
pub use schedule::{ProbeKind, ProbeSchedule};

use crate::broker::{BrokerRecord, BrokerRegistry};
use crate::probe_span;
use crate::transport::TransportFactory;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the monitor notification channel
pub const MONITOR_EVENT_CAPACITY: usize = 64;

/// Monitor cadences plus the probe settings
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    pub latency_interval: Duration,
    pub bandwidth_interval: Duration,
    pub connection_check_interval: Duration,
    pub probe: ProbeConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(20),
            latency_interval: Duration::from_secs(5),
            bandwidth_interval: Duration::from_secs(10),
            connection_check_interval: Duration::from_secs(15),
            probe: ProbeConfig::default(),
        }
    }
}

impl MonitorConfig {
    fn schedule(&self, started: Instant) -> ProbeSchedule {
        ProbeSchedule::new(
            self.latency_interval,
            self.bandwidth_interval,
            self.connection_check_interval,
            started,
        )
    }
}

/// Notifications from the monitor task
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    MetricsUpdated {
        uri: String,
        latency: f64,
        bandwidth: f64,
        connection_count: u32,
    },
    /// The registry's best broker beats the current one by the hysteresis margin
    SwitchRecommended { uri: String },
}

/// Shared between the monitor handle and its task
struct MonitorCore {
    registry: Arc<BrokerRegistry>,
    prober: BrokerProber,
    config: MonitorConfig,
    events: mpsc::Sender<MonitorEvent>,
    stop: watch::Sender<bool>,
}

/// Resolve once a stop has been requested
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

impl MonitorCore {
    fn notify_metrics(&self, event: MonitorEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(?event, "Monitor event channel full, dropping metrics update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Monitor event receiver dropped");
            }
        }
    }

    async fn recommend_switch(&self, uri: String) {
        let mut stop_rx = self.stop.subscribe();
        tokio::select! {
            biased;
            sent = self.events.send(MonitorEvent::SwitchRecommended { uri }) => {
                if sent.is_err() {
                    debug!("Monitor event receiver dropped");
                }
            }
            _ = stop_requested(&mut stop_rx) => {
                warn!("Monitor stopped before the switch recommendation was delivered");
            }
        }
    }

    /// Write fresh metrics, keeping the last known values of the others
    async fn record_metrics(
        &self,
        uri: &str,
        recover: bool,
        merge: impl FnOnce(&BrokerRecord) -> (f64, f64, u32),
    ) {
        let Some(record) = self.registry.get(uri) else {
            debug!(broker = %uri, "Broker removed while probing");
            return;
        };

        if recover && !record.available {
            info!(broker = %uri, "Broker reachable again, marking available");
            self.registry.mark_available(uri);
        }

        let (latency, bandwidth, connection_count) = merge(&record);
        self.registry
            .update_metrics(uri, latency, bandwidth, connection_count);
        self.notify_metrics(MonitorEvent::MetricsUpdated {
            uri: uri.to_string(),
            latency,
            bandwidth,
            connection_count,
        });

        if self.registry.should_switch() {
            if let Some(best) = self.registry.find_best() {
                info!(
                    current = %self.registry.current_uri(),
                    best = %best.uri,
                    score = best.score,
                    "Broker switch recommended"
                );
                self.recommend_switch(best.uri).await;
            }
        }
    }

    fn probe_failed(&self, kind: ProbeKind, uri: &str, error: &ProbeError) {
        if kind.is_fatal() {
            warn!(broker = %uri, probe = %kind, error = %error, "Probe failed, marking broker unavailable");
            self.registry.mark_unavailable(uri);
        } else {
            warn!(broker = %uri, probe = %kind, error = %error, "Probe failed, keeping previous metrics");
        }
    }

    async fn run_probe(&self, kind: ProbeKind, uri: &str) {
        match kind {
            ProbeKind::Latency => match self.prober.measure_latency(uri).await {
                Ok(latency) => {
                    debug!(broker = %uri, latency, "Latency measured");
                    self.record_metrics(uri, true, |r| (latency, r.bandwidth, r.connection_count))
                        .await
                }
                Err(e) => self.probe_failed(kind, uri, &e),
            },
            ProbeKind::Bandwidth => match self.prober.measure_bandwidth(uri).await {
                Ok(bandwidth) => {
                    debug!(broker = %uri, bandwidth, "Bandwidth measured");
                    self.record_metrics(uri, true, |r| (r.latency, bandwidth, r.connection_count))
                        .await
                }
                Err(e) => self.probe_failed(kind, uri, &e),
            },
            ProbeKind::ConnectionCount => match self.prober.fetch_connection_count(uri).await {
                Ok(count) => {
                    debug!(broker = %uri, connection_count = count, "Connection count read");
                    self.record_metrics(uri, false, |r| (r.latency, r.bandwidth, count))
                        .await
                }
                Err(e) => self.probe_failed(kind, uri, &e),
            },
        }
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_interval.as_secs_f64(),
            "Broker monitoring started"
        );
        let mut schedule = self.config.schedule(Instant::now());

        'ticks: loop {
            let now = Instant::now();
            for kind in schedule.due(now) {
                for uri in self.registry.list_uris() {
                    if *stop_rx.borrow() {
                        break 'ticks;
                    }
                    self.run_probe(kind, &uri)
                        .instrument(probe_span!(broker = %uri, probe = %kind))
                        .await;
                }
                schedule.mark_run(kind, now);
            }

            if !interruptible_sleep(&mut stop_rx, self.config.tick_interval).await {
                break;
            }
        }
        info!("Broker monitoring stopped");
    }
}

/// Sleep for `duration` unless a stop is signalled first
///
/// Returns false when the task should exit.
async fn interruptible_sleep(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = stop_rx.changed() => changed.is_ok() && !*stop_rx.borrow(),
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Periodically probes every registered broker in a background task
pub struct BrokerMonitor {
    core: Arc<MonitorCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerMonitor {
    /// Create a stopped monitor and the receiver for its notifications
    pub fn new(
        registry: Arc<BrokerRegistry>,
        factory: Arc<dyn TransportFactory>,
        config: MonitorConfig,
    ) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (events, rx) = mpsc::channel(MONITOR_EVENT_CAPACITY);
        let prober = BrokerProber::new(factory, config.probe.clone());
        let (stop, _) = watch::channel(false);
        let monitor = Self {
            core: Arc::new(MonitorCore {
                registry,
                prober,
                config,
                events,
                stop,
            }),
            task: Mutex::new(None),
        };
        (monitor, rx)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.core.config
    }

    /// Spawn the monitoring task; no-op while it is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.core.stop.send_replace(false);
        let stop_rx = self.core.stop.subscribe();
        *task = Some(tokio::spawn(self.core.clone().run(stop_rx)));
    }

    /// Signal the task to stop and wait for it; no-op when not running
    ///
    /// An in-flight probe finishes (bounded by its own timeout) before the
    /// task observes the signal.
    pub async fn stop(&self) {
        let Some(handle) = self.task().take() else {
            return;
        };
        self.core.stop.send_replace(true);
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one probe against one broker immediately, applying its result
    pub async fn run_probe(&self, kind: ProbeKind, uri: &str) {
        self.core
            .run_probe(kind, uri)
            .instrument(probe_span!(broker = %uri, probe = %kind))
            .await;
    }
}

impl Drop for BrokerMonitor {
    fn drop(&mut self) {
        self.core.stop.send_replace(true);
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}
