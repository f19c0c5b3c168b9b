//! Synthetic vehicle telemetry publisher
//!
//! Publishes a random-walk location for each vehicle every tick (QoS 1) to
//! `/fleet/vehicle/{id}/location` on the configured MQTT broker.
//!
//! Usage:
//!   cargo run --bin fleet-publisher                         # one vehicle, B1234XYZ
//!   cargo run --bin fleet-publisher -- --random-plates 5    # five random plates

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use fleet_geofence::infra::{logging, Config};
use fleet_geofence::services::telemetry_sim::{location_topic, random_plate, VehicleWalker};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleet-publisher", version, about = "Synthetic vehicle telemetry publisher")]
struct Args {
    /// Path to TOML configuration file (broker address and geofence center)
    #[arg(short, long)]
    config: Option<String>,

    /// Vehicle plate to simulate (repeatable)
    #[arg(short, long = "vehicle", default_value = "B1234XYZ")]
    vehicles: Vec<String>,

    /// Simulate this many random plates instead of --vehicle
    #[arg(long)]
    random_plates: Option<usize>,

    /// Seconds between samples
    #[arg(long, default_value_t = 2)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()))?;
    let region = config.geofence();

    let mut rng = rand::thread_rng();
    let plates = match args.random_plates {
        Some(n) => (0..n).map(|_| random_plate(&mut rng)).collect(),
        None => args.vehicles.clone(),
    };
    let mut walkers: Vec<VehicleWalker> =
        plates.into_iter().map(|plate| VehicleWalker::new(plate, &region, &mut rng)).collect();

    let client_id = format!("{}-publisher", config.mqtt_client_id());
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(config.mqtt_keep_alive());
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 100);

    // Drive the connection; publishes are queued until it is up
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt_connected"),
                Ok(Event::Incoming(Packet::PubAck(ack))) => debug!(pkid = %ack.pkid, "publish_acked"),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "mqtt_connection_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        vehicles = ?walkers.iter().map(|w| w.vehicle_id()).collect::<Vec<_>>(),
        interval_secs = %args.interval_secs,
        "fleet_publisher_started"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                let _ = client.disconnect().await;
                return Ok(());
            }
            _ = ticker.tick() => {
                let timestamp = Utc::now().timestamp();
                for walker in walkers.iter_mut() {
                    let record = walker.step(&mut rng, timestamp);
                    let topic = location_topic(&record.vehicle_id);
                    let payload = serde_json::to_vec(&record).context("Failed to encode location")?;

                    match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                        Ok(()) => info!(
                            topic = %topic,
                            lat = %format!("{:.6}", record.latitude),
                            lon = %format!("{:.6}", record.longitude),
                            inside = %region.contains(record.latitude, record.longitude),
                            "location_published"
                        ),
                        Err(e) => warn!(topic = %topic, error = %e, "location_publish_failed"),
                    }
                }
            }
        }
    }
}
