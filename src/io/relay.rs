//! Durable relay of geofence events to the AMQP broker
//!
//! Events are published as JSON to a durable direct exchange bound to a
//! durable queue. Publisher confirms are enabled on the channel and every
//! publish waits for the broker's confirm, so a successful return means the
//! broker has taken responsibility for the message. The whole publish,
//! including any reconnect, is bounded by `[amqp] publish_timeout_ms`.

use crate::domain::types::GeofenceEvent;
use crate::infra::config::Config;
use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("publish not confirmed within {0:?}")]
    Timeout(Duration),
    #[error("amqp channel error: {0}")]
    Channel(String),
    #[error("broker negatively acknowledged the event")]
    Nacked,
    #[error("event serialization failed: {0}")]
    Serialization(String),
    #[error("broker unavailable")]
    Unavailable,
}

impl From<lapin::Error> for RelayError {
    fn from(e: lapin::Error) -> Self {
        RelayError::Channel(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

/// Outbound seam for detected events
///
/// Implementations return only once the event is durably accepted downstream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), RelayError>;
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), RelayError> {
        (**self).publish(event).await
    }
}

/// Run `fut` with an upper bound, mapping expiry to `RelayError::Timeout`
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(timeout)),
    }
}

/// Exchange, queue and binding shared by the publisher and the worker
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exchange: config.amqp_exchange().to_string(),
            queue: config.amqp_queue().to_string(),
            routing_key: config.amqp_routing_key().to_string(),
        }
    }

    /// Declare durable exchange + queue and bind them
    ///
    /// Declarations are idempotent, so every new connection re-runs this.
    pub async fn declare(&self, channel: &Channel) -> Result<(), lapin::Error> {
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

/// Open a connection and a channel with the topology declared
pub async fn open_channel(
    url: &str,
    connection_name: &str,
    topology: &Topology,
) -> Result<(Connection, Channel), lapin::Error> {
    let properties = ConnectionProperties::default().with_connection_name(connection_name.into());
    let connection = Connection::connect(url, properties).await?;
    let channel = connection.create_channel().await?;
    topology.declare(&channel).await?;
    Ok((connection, channel))
}

struct Link {
    // Dropping the connection closes the channel
    _connection: Connection,
    channel: Channel,
}

/// Publisher-confirm AMQP producer
pub struct AmqpPublisher {
    url: String,
    topology: Topology,
    publish_timeout: Duration,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl AmqpPublisher {
    /// Connect and declare topology; failure here is fatal to the caller
    pub async fn connect(config: &Config) -> Result<Self, RelayError> {
        let publisher = Self {
            url: config.amqp_url().to_string(),
            topology: Topology::from_config(config),
            publish_timeout: config.amqp_publish_timeout(),
            link: tokio::sync::Mutex::new(None),
        };
        let link = publisher.open_link().await?;
        *publisher.link.lock().await = Some(link);

        info!(
            exchange = %publisher.topology.exchange,
            queue = %publisher.topology.queue,
            routing_key = %publisher.topology.routing_key,
            "amqp_publisher_connected"
        );
        Ok(publisher)
    }

    async fn open_link(&self) -> Result<Link, RelayError> {
        let (connection, channel) =
            open_channel(&self.url, "fleet-geofence-publisher", &self.topology).await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(Link { _connection: connection, channel })
    }

    /// Current channel, reopening it if the broker dropped the connection
    async fn channel(&self) -> Result<Channel, RelayError> {
        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if current.channel.status().connected() {
                return Ok(current.channel.clone());
            }
            warn!("amqp_channel_lost");
        }
        *link = None;
        let fresh = self.open_link().await.map_err(|e| {
            debug!(error = %e, "amqp_reconnect_failed");
            RelayError::Unavailable
        })?;
        let channel = fresh.channel.clone();
        *link = Some(fresh);
        info!("amqp_publisher_reconnected");
        Ok(channel)
    }

    async fn publish_confirmed(&self, payload: Vec<u8>) -> Result<(), RelayError> {
        let channel = self.channel().await?;
        publish_persistent(&channel, &self.topology, &payload, FieldTable::default()).await
    }
}

/// Publish one persistent JSON message and wait for the broker's confirm
///
/// The channel must be in confirm mode, otherwise the confirm resolves as
/// not requested and the call returns as soon as the frame is written.
pub async fn publish_persistent(
    channel: &Channel,
    topology: &Topology,
    payload: &[u8],
    headers: FieldTable,
) -> Result<(), RelayError> {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);

    let confirm = channel
        .basic_publish(
            &topology.exchange,
            &topology.routing_key,
            BasicPublishOptions::default(),
            payload,
            properties,
        )
        .await?
        .await?;

    if confirm.is_nack() {
        return Err(RelayError::Nacked);
    }
    Ok(())
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), RelayError> {
        let payload = serde_json::to_vec(event)?;
        bounded(self.publish_timeout, self.publish_confirmed(payload)).await
    }
}
