//! MQTT subscriber for vehicle location telemetry
//!
//! Subscribes with QoS 1 on a persistent session and acknowledges each
//! publish only after the ingest pipeline has finished with it, whatever the
//! outcome. Messages are processed one at a time in arrival order.

use crate::domain::types::PositionRecord;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::ingest::LocationHandler;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Back-off before polling the event loop again after a connection error
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed position payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode a location payload
pub fn decode_position(payload: &[u8]) -> Result<PositionRecord, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Extract the segment matched by the single-level wildcard in `filter`
///
/// `topic_vehicle_id("/fleet/vehicle/+/location", "/fleet/vehicle/B1/location") == Some("B1")`
pub fn topic_vehicle_id<'a>(filter: &str, topic: &'a str) -> Option<&'a str> {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("+"), Some(segment)) => return Some(segment),
            (Some(f), Some(t)) if f == t => continue,
            _ => return None,
        }
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(config.mqtt_keep_alive());
    // Persistent session so QoS 1 messages queued while offline are delivered
    options.set_clean_session(false);
    options.set_manual_acks(true);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    options
}

async fn handle_publish<H>(
    publish: &Publish,
    topic_filter: &str,
    handler: &H,
    metrics: &Metrics,
) where
    H: LocationHandler + ?Sized,
{
    metrics.record_position_received();

    let record = match decode_position(&publish.payload) {
        Ok(record) => record,
        Err(e) => {
            warn!(topic = %publish.topic, error = %e, "position_decode_failed");
            metrics.record_position_malformed();
            return;
        }
    };

    if let Some(topic_id) = topic_vehicle_id(topic_filter, &publish.topic) {
        if topic_id != record.vehicle_id {
            warn!(
                topic = %publish.topic,
                topic_vehicle_id = %topic_id,
                payload_vehicle_id = %record.vehicle_id,
                "vehicle_id_topic_mismatch"
            );
        }
    }

    let outcome = handler.on_location(record).await;
    debug!(topic = %publish.topic, outcome = ?outcome, "position_processed");
}

/// Handle one event from the MQTT event loop
///
/// Client errors only affect the message or subscription that raised them.
/// They are logged and counted, and the caller keeps polling.
async fn on_event<H>(event: Event, client: &AsyncClient, topic: &str, handler: &H, metrics: &Metrics)
where
    H: LocationHandler + ?Sized,
{
    match event {
        Event::Incoming(Packet::Publish(publish)) => {
            handle_publish(&publish, topic, handler, metrics).await;
            // Acknowledge regardless of outcome; failures are logged and counted
            if let Err(e) = client.try_ack(&publish) {
                metrics.record_mqtt_client_error();
                warn!(topic = %publish.topic, pkid = %publish.pkid, error = %e, "mqtt_ack_failed");
            }
        }
        Event::Incoming(Packet::ConnAck(ack)) => {
            info!(session_present = %ack.session_present, "mqtt_connected");
            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                metrics.record_mqtt_client_error();
                error!(topic = %topic, error = %e, "mqtt_subscribe_failed");
            }
        }
        Event::Incoming(Packet::SubAck(_)) => {
            info!(topic = %topic, "mqtt_subscribed");
        }
        _ => {}
    }
}

/// Run the subscriber until shutdown
///
/// Connection errors are logged and the event loop is polled again after a
/// short back-off; rumqttc reconnects on the next poll. A failed subscribe is
/// retried on the next ConnAck.
pub async fn start_mqtt_subscriber<H>(
    config: &Config,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) where
    H: LocationHandler + ?Sized,
{
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 100);
    let topic = config.mqtt_topic().to_string();

    info!(topic = %topic, host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_subscriber_starting");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    let _ = client.try_disconnect();
                    return;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(event) => on_event(event, &client, &topic, &*handler, &metrics).await,
                    Err(e) => {
                        error!(error = %e, "mqtt_connection_error");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }
    }
}
