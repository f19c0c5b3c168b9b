//! Fleet geofence server
//!
//! Ingests vehicle locations over MQTT, stores them in SQLite, and relays
//! geofence entries to a durable AMQP queue. Also serves the HTTP query API.
//!
//! Module structure:
//! - `domain/` - Position records, validation, geofence math
//! - `store/` - SQLite position store
//! - `io/` - External interfaces (MQTT, AMQP relay and consumer, HTTP)
//! - `services/` - Ingest pipeline
//! - `infra/` - Infrastructure (Config, Metrics, Logging, Broker)

use anyhow::Context;
use clap::Parser;
use fleet_geofence::infra::{broker, logging, Config, Metrics};
use fleet_geofence::io::http_api::start_http_server;
use fleet_geofence::io::{start_mqtt_subscriber, AmqpPublisher};
use fleet_geofence::services::Ingestor;
use fleet_geofence::store::SqliteLocationStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Fleet geofence server - MQTT ingest, geofence relay and query API
#[derive(Parser, Debug)]
#[command(name = "fleet-server", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()))?;

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "fleet_server_starting");

    let region = config.geofence();
    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        amqp_exchange = %config.amqp_exchange(),
        amqp_queue = %config.amqp_queue(),
        store_path = %config.store_path(),
        geofence_lat = %region.center_latitude(),
        geofence_lon = %region.center_longitude(),
        geofence_radius_m = %region.radius_m(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    broker::start_embedded_broker(&config);

    let store = Arc::new(
        SqliteLocationStore::open(Path::new(config.store_path()))
            .with_context(|| format!("Failed to open store at {}", config.store_path()))?,
    );
    let publisher = AmqpPublisher::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to AMQP broker at {}", config.amqp_url()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let ingestor = Arc::new(Ingestor::new(store.clone(), publisher, region, metrics.clone()));

    // MQTT subscriber
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    let mqtt_task = tokio::spawn(async move {
        start_mqtt_subscriber(&mqtt_config, ingestor, mqtt_metrics, mqtt_shutdown).await;
    });

    // HTTP API (if port > 0)
    let http_task = if config.http_enabled() {
        let http_addr: SocketAddr = format!("{}:{}", config.http_bind_address(), config.http_port())
            .parse()
            .context("Invalid [http] bind address")?;
        let http_metrics = metrics.clone();
        let http_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_http_server(http_addr, store, http_metrics, http_shutdown).await {
                error!(error = %e, "http_server_error");
            }
        }))
    } else {
        info!("http_api_disabled");
        None
    };

    // Metrics reporter
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // In-flight messages finish before the tasks exit
    let _ = mqtt_task.await;
    if let Some(http_task) = http_task {
        let _ = http_task.await;
    }

    info!("fleet_server_shutdown_complete");
    Ok(())
}
