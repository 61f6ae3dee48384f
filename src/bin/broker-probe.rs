//! Broker Probe - one-shot broker measurement
//!
//! Runs the latency, bandwidth and connection-count probes once against each
//! broker and prints the measurements, with the resulting category score, as
//! JSON.

use adaptive_publisher::broker::{BrokerRegistry, WeightTable};
use adaptive_publisher::config::PublisherConfig;
use adaptive_publisher::monitor::{BrokerProber, ProbeKind};
use adaptive_publisher::observability::init_default_logging;
use adaptive_publisher::transport::mqtt::RumqttTransportFactory;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Measure MQTT brokers once and report their scores
#[derive(Parser)]
#[command(name = "broker-probe")]
#[command(about = "Probe MQTT brokers for latency, bandwidth and connection count")]
#[command(version)]
struct Args {
    /// Configuration file supplying probe settings and the default broker list
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device category used to score the results
    #[arg(long)]
    category: Option<String>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,

    /// Broker URIs to probe
    brokers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BrokerReport {
    uri: String,
    latency_ms: Option<f64>,
    bandwidth_bps: Option<f64>,
    connection_count: Option<u32>,
    score: f64,
    available: bool,
    errors: BTreeMap<ProbeKind, String>,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    category: String,
    measured_at: DateTime<Utc>,
    brokers: Vec<BrokerReport>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_default_logging();

    match run(args).await {
        Ok(report) => println!("{report}"),
        Err(e) => {
            error!("Broker probe failed: {}", e);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<String, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => PublisherConfig::load_from_file(path)?,
        None => PublisherConfig::default(),
    };
    let category = args
        .category
        .unwrap_or_else(|| config.publisher.category.clone());
    let brokers = if args.brokers.is_empty() {
        config.mqtt.brokers.clone()
    } else {
        args.brokers
    };

    let monitor = config.monitor_config()?;
    let factory = Arc::new(RumqttTransportFactory::new(config.mqtt.clone()));
    let prober = BrokerProber::new(factory, monitor.probe);
    let registry = BrokerRegistry::new(&category, &config.weight_table());

    let mut reports = Vec::with_capacity(brokers.len());
    for uri in &brokers {
        info!(broker = %uri, "Probing broker");
        reports.push(probe_broker(&prober, &registry, uri).await);
    }

    let report = ProbeReport {
        category: registry.category().to_string(),
        measured_at: Utc::now(),
        brokers: reports,
    };
    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    Ok(json)
}

/// Run all three probes, scoring with whatever succeeded
async fn probe_broker(prober: &BrokerProber, registry: &BrokerRegistry, uri: &str) -> BrokerReport {
    let mut errors = BTreeMap::new();

    let latency = prober
        .measure_latency(uri)
        .await
        .map_err(|e| errors.insert(ProbeKind::Latency, e.to_string()))
        .ok();
    let bandwidth = prober
        .measure_bandwidth(uri)
        .await
        .map_err(|e| errors.insert(ProbeKind::Bandwidth, e.to_string()))
        .ok();
    let connection_count = prober
        .fetch_connection_count(uri)
        .await
        .map_err(|e| errors.insert(ProbeKind::ConnectionCount, e.to_string()))
        .ok();

    registry.add(uri);
    registry.update_metrics(
        uri,
        latency.unwrap_or(0.0),
        bandwidth.unwrap_or(0.0),
        connection_count.unwrap_or(0),
    );
    if errors.keys().any(|kind| kind.is_fatal()) {
        registry.mark_unavailable(uri);
    }
    let record = registry.get(uri);

    BrokerReport {
        uri: uri.to_string(),
        latency_ms: latency,
        bandwidth_bps: bandwidth,
        connection_count,
        score: record.as_ref().map_or(0.0, |r| r.score),
        available: record.is_some_and(|r| r.available),
        errors,
    }
}
