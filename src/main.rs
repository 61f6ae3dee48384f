//! Self-adaptive MQTT publisher - demo entry point
//!
//! Publishes a numbered message every few seconds through whichever broker
//! the publisher currently considers best, reconnecting whenever the
//! connection is down.

use adaptive_publisher::config::PublisherConfig;
use adaptive_publisher::observability::init_default_logging;
use adaptive_publisher::{AdaptivePublisher, QoS};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Self-adaptive MQTT publisher
#[derive(Parser)]
#[command(name = "adaptive-publisher")]
#[command(about = "MQTT publisher with metric-driven broker selection and failover")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run the publishing loop until interrupted
    Run {
        /// Device category selecting the weight profile
        #[arg(long)]
        category: Option<String>,

        /// Broker URIs, overriding the configured list
        brokers: Vec<String>,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        "Starting self-adaptive publisher v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { category, brokers } => {
            run_publisher(apply_overrides(config, category, brokers)).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(PublisherConfig::load_from_file(path)?);
    }

    let default_paths = ["publisher.toml", "config/publisher.toml"];
    for path_str in default_paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(PublisherConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(PublisherConfig::default())
}

fn apply_overrides(
    mut config: PublisherConfig,
    category: Option<String>,
    brokers: Vec<String>,
) -> PublisherConfig {
    if let Some(category) = category {
        config.publisher.category = category;
    }
    if !brokers.is_empty() {
        config.mqtt.brokers = brokers;
    }
    config
}

async fn run_publisher(config: PublisherConfig) -> Result<(), Box<dyn std::error::Error>> {
    let publisher = AdaptivePublisher::from_config(&config)?;
    info!(
        category = %publisher.category(),
        brokers = ?config.mqtt.brokers,
        "Publisher configured"
    );

    publisher.set_connection_lost_callback(Arc::new(|cause: &str| {
        warn!(cause, "Connection lost");
    }));
    publisher.set_connected_callback(Arc::new(|uri: &str| {
        info!(broker = uri, "Connection established");
    }));
    publisher.set_message_callback(Arc::new(|topic: &str, payload: &[u8]| {
        info!(
            topic,
            payload = %String::from_utf8_lossy(payload),
            "Message received"
        );
    }));

    publisher.start_monitoring();
    info!("Broker monitoring started");

    if !publisher.connect().await {
        publisher.stop_monitoring().await;
        return Err("initial connection failed on every broker".into());
    }
    info!(broker = %publisher.current_broker_uri(), "Initial connection complete");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = publish_loop(&publisher, &config) => {}
    }

    publisher.shutdown().await;
    Ok(())
}

/// Publish, report and reconnect on a one second poll; never returns
async fn publish_loop(publisher: &AdaptivePublisher, config: &PublisherConfig) {
    let publish_every = Duration::from_secs(config.publisher.publish_interval_secs);
    let stats_every = Duration::from_secs(config.publisher.stats_interval_secs);
    let topic = &config.publisher.publish_topic;

    let mut poll = interval(Duration::from_secs(1));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_publish = Instant::now();
    let mut last_stats = Instant::now();
    let mut message_count: u64 = 0;

    loop {
        poll.tick().await;
        let now = Instant::now();

        if publisher.is_connected() && now.duration_since(last_publish) >= publish_every {
            message_count += 1;
            let payload = format!("Hello from self-adaptive publisher! Message #{message_count}");
            match publisher
                .publish(topic, payload.clone(), QoS::AtLeastOnce, false)
                .await
            {
                Some(token) => info!(topic = %topic, %payload, token = %token, "Message sent"),
                None => warn!(topic = %topic, %payload, "Message queued, no delivery token"),
            }
            last_publish = now;
        }

        if now.duration_since(last_stats) >= stats_every {
            report_stats(publisher);
            last_stats = now;
        }

        if !publisher.is_connected() {
            warn!("Not connected, attempting to reconnect...");
            if publisher.connect().await {
                info!(broker = %publisher.current_broker_uri(), "Reconnected");
            } else {
                warn!("Reconnect failed");
            }
        }
    }
}

fn report_stats(publisher: &AdaptivePublisher) {
    info!(
        broker = %publisher.current_broker_uri(),
        connected = publisher.is_connected(),
        queued = publisher.queued_message_count(),
        monitoring = publisher.is_monitoring(),
        "Publisher statistics"
    );
    for record in publisher.broker_stats() {
        info!(
            broker = %record.uri,
            latency_ms = record.latency,
            bandwidth_bps = record.bandwidth,
            connections = record.connection_count,
            score = record.score,
            available = record.available,
            "Broker statistics"
        );
    }
}

fn handle_config_command(
    config: &PublisherConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
