//! Geofence alert worker
//!
//! Consumes geofence events from the durable AMQP queue and raises an alert
//! for each one. Deliveries are acknowledged only after the alert is raised.
//!
//! Usage:
//!   cargo run --bin fleet-worker -- --config config/dev.toml

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use fleet_geofence::domain::GeofenceEvent;
use fleet_geofence::infra::{logging, Config, Metrics};
use fleet_geofence::io::{consume, AmqpConsumer, EventHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Wait before reconnecting after the consumer stream fails
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "fleet-worker", version, about = "Geofence alert worker")]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Terminal handler: one structured alert line per event
struct AlertHandler;

#[async_trait]
impl EventHandler for AlertHandler {
    async fn handle(&self, event: &GeofenceEvent) -> anyhow::Result<()> {
        info!(
            vehicle_id = %event.vehicle_id,
            event = %event.event,
            lat = %event.location.latitude,
            lon = %event.location.longitude,
            timestamp = %event.timestamp,
            "geofence_alert"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()))?;
    info!(git_hash = %env!("GIT_HASH"), queue = %config.amqp_queue(), "fleet_worker_starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let metrics = Arc::new(Metrics::new());
    let metrics_interval = config.metrics_interval_secs().max(1);
    let reporter_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            reporter_metrics.report().log_consumer();
        }
    });

    let handler = AlertHandler;
    let mut consumer = AmqpConsumer::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to AMQP broker at {}", config.amqp_url()))?;

    loop {
        match consume(&mut consumer, &handler, &metrics, shutdown_rx.clone()).await {
            Ok(()) => break,
            Err(e) => error!(error = %e, consumer_tag = %consumer.tag(), "consumer_failed"),
        }

        // Reconnect until it works or shutdown is requested
        loop {
            if *shutdown_rx.borrow() {
                info!("fleet_worker_shutdown_complete");
                return Ok(());
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            match AmqpConsumer::connect(&config).await {
                Ok(fresh) => {
                    consumer = fresh;
                    info!(consumer_tag = %consumer.tag(), "consumer_reconnected");
                    break;
                }
                Err(e) => warn!(error = %e, "consumer_reconnect_failed"),
            }
        }
    }

    info!("fleet_worker_shutdown_complete");
    Ok(())
}
