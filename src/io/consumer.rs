//! Geofence event worker loop
//!
//! Pulls deliveries from the durable queue one at a time. A delivery is only
//! acknowledged after the handler has finished with it. A handler failure
//! puts the event back on the queue with its attempt count raised; once
//! `MAX_HANDLER_ATTEMPTS` failures have been recorded the event is discarded.
//! The broker's own redelivered flag never counts as a failure, since it is
//! also set when a worker dies before acking.

use crate::domain::types::GeofenceEvent;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::relay::{open_channel, publish_persistent, Topology};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ConfirmSelectOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handler failures allowed per event before it is discarded
pub const MAX_HANDLER_ATTEMPTS: u32 = 3;

/// Message header carrying the number of failed handler attempts
pub const ATTEMPTS_HEADER: &str = "x-handler-attempts";

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("amqp channel error: {0}")]
    Channel(String),
    #[error("delivery stream closed")]
    Closed,
}

impl From<lapin::Error> for ConsumeError {
    fn from(e: lapin::Error) -> Self {
        ConsumeError::Channel(e.to_string())
    }
}

/// One message taken from the queue and not yet settled
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// True when the broker has handed this message out before
    fn redelivered(&self) -> bool;

    /// Failed handler attempts recorded against this message
    fn attempts(&self) -> u32;

    async fn ack(&self) -> Result<(), ConsumeError>;

    /// Drop the message without requeue
    async fn discard(&self) -> Result<(), ConsumeError>;

    /// Put the message back on the queue with one more recorded attempt
    async fn retry(&self) -> Result<(), ConsumeError>;
}

/// Source of deliveries (AMQP consumer or in-memory broker)
#[async_trait]
pub trait DeliverySource: Send {
    type Delivery: Delivery;

    /// Next delivery, or None once the source is closed
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery, ConsumeError>>;
}

/// Terminal handler for decoded events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &GeofenceEvent) -> anyhow::Result<()>;
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Rejected without requeue (undecodable, or out of attempts)
    Discarded,
    /// Queued again after a handler failure
    Requeued,
}

/// Decode, handle and settle a single delivery
pub async fn process_delivery<D, H>(
    delivery: &D,
    handler: &H,
    metrics: &Metrics,
) -> Result<DeliveryOutcome, ConsumeError>
where
    D: Delivery + ?Sized,
    H: EventHandler + ?Sized,
{
    let event: GeofenceEvent = match serde_json::from_slice(delivery.body()) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, bytes = %delivery.body().len(), "event_decode_failed");
            delivery.discard().await?;
            metrics.record_event_discarded();
            return Ok(DeliveryOutcome::Discarded);
        }
    };

    match handler.handle(&event).await {
        Ok(()) => {
            delivery.ack().await?;
            metrics.record_event_consumed();
            debug!(vehicle_id = %event.vehicle_id, timestamp = %event.timestamp, "event_acked");
            Ok(DeliveryOutcome::Acked)
        }
        Err(e) => {
            let attempts = delivery.attempts().saturating_add(1);
            if attempts < MAX_HANDLER_ATTEMPTS {
                warn!(
                    error = %e,
                    vehicle_id = %event.vehicle_id,
                    attempts = %attempts,
                    redelivered = %delivery.redelivered(),
                    "event_handler_failed_retry"
                );
                delivery.retry().await?;
                metrics.record_event_requeued();
                Ok(DeliveryOutcome::Requeued)
            } else {
                error!(
                    error = %e,
                    vehicle_id = %event.vehicle_id,
                    timestamp = %event.timestamp,
                    attempts = %attempts,
                    "event_handler_failed_discard"
                );
                delivery.discard().await?;
                metrics.record_event_discarded();
                Ok(DeliveryOutcome::Discarded)
            }
        }
    }
}

/// Run the worker loop until shutdown or until the source closes
///
/// A delivery already being handled is settled before shutdown is observed.
pub async fn consume<S, H>(
    source: &mut S,
    handler: &H,
    metrics: &Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumeError>
where
    S: DeliverySource,
    H: EventHandler + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("consumer_shutdown");
                    return Ok(());
                }
                continue;
            }
            next = source.next_delivery() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                process_delivery(&delivery, handler, metrics).await?;
            }
            Some(Err(e)) => {
                error!(error = %e, "consumer_delivery_error");
                return Err(e);
            }
            None => {
                warn!("consumer_stream_closed");
                return Err(ConsumeError::Closed);
            }
        }
    }
}

/// Read the attempt count from message headers; absent or unreadable is zero
pub fn attempts_from_headers(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers
        .and_then(|table| table.inner().iter().find(|(key, _)| key.as_str() == ATTEMPTS_HEADER))
        .map(|(_, value)| value)
    else {
        return 0;
    };
    match value {
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::ShortUInt(n) => u32::from(*n),
        AMQPValue::ShortShortUInt(n) => u32::from(*n),
        AMQPValue::LongInt(n) => (*n).max(0).unsigned_abs(),
        AMQPValue::LongLongInt(n) => (*n).clamp(0, i64::from(u32::MAX)) as u32,
        _ => 0,
    }
}

/// Copy of `headers` with the attempt count set to `attempts`
pub fn headers_with_attempts(headers: Option<&FieldTable>, attempts: u32) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(ATTEMPTS_HEADER.into(), AMQPValue::LongUInt(attempts));
    table
}

/// AMQP delivery together with the channel it arrived on
///
/// Retrying republishes the body through the same exchange with the
/// attempt header raised, waits for the confirm, then acks the original.
pub struct AmqpMessage {
    delivery: AmqpDelivery,
    channel: Channel,
    topology: Arc<Topology>,
}

#[async_trait]
impl Delivery for AmqpMessage {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    fn attempts(&self) -> u32 {
        attempts_from_headers(self.delivery.properties.headers().as_ref())
    }

    async fn ack(&self) -> Result<(), ConsumeError> {
        self.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn discard(&self) -> Result<(), ConsumeError> {
        self.delivery.acker.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
        Ok(())
    }

    async fn retry(&self) -> Result<(), ConsumeError> {
        let headers = headers_with_attempts(
            self.delivery.properties.headers().as_ref(),
            self.attempts().saturating_add(1),
        );
        publish_persistent(&self.channel, &self.topology, &self.delivery.data, headers)
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))?;
        self.ack().await
    }
}

/// AMQP queue consumer with bounded prefetch
pub struct AmqpConsumer {
    _connection: Connection,
    channel: Channel,
    topology: Arc<Topology>,
    consumer: lapin::Consumer,
    tag: String,
}

impl AmqpConsumer {
    pub async fn connect(config: &Config) -> Result<Self, ConsumeError> {
        let topology = Topology::from_config(config);
        let (connection, channel) =
            open_channel(config.amqp_url(), "fleet-geofence-worker", &topology).await?;
        channel.basic_qos(config.amqp_prefetch(), BasicQosOptions::default()).await?;
        // Retries are republished on this channel and must be confirmed
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let tag = format!("fleet-worker-{}", Uuid::now_v7());
        let consumer = channel
            .basic_consume(
                &topology.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %topology.queue,
            prefetch = %config.amqp_prefetch(),
            max_attempts = %MAX_HANDLER_ATTEMPTS,
            consumer_tag = %tag,
            "amqp_consumer_started"
        );
        Ok(Self { _connection: connection, channel, topology: Arc::new(topology), consumer, tag })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl DeliverySource for AmqpConsumer {
    type Delivery = AmqpMessage;

    async fn next_delivery(&mut self) -> Option<Result<AmqpMessage, ConsumeError>> {
        let item = self.consumer.next().await?;
        Some(item.map_err(ConsumeError::from).map(|delivery| AmqpMessage {
            delivery,
            channel: self.channel.clone(),
            topology: self.topology.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PositionRecord;
    use crate::io::memory_broker::MemoryBroker;
    use crate::io::relay::EventPublisher;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_event(vehicle_id: &str, timestamp: i64) -> GeofenceEvent {
        GeofenceEvent::entry(&PositionRecord::new(vehicle_id, -6.19381, 106.82303, timestamp))
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<GeofenceEvent>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &GeofenceEvent) -> anyhow::Result<()> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` calls, then succeeds
    struct FlakyHandler {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &GeofenceEvent) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("alert sink unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ack_after_handler_success() {
        let broker = MemoryBroker::new();
        broker.publish(&sample_event("B1234XYZ", 1_700_000_000)).await.unwrap();

        let mut consumer = broker.subscribe();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        let handler = RecordingHandler::default();
        let metrics = Metrics::new();

        let outcome = process_delivery(&delivery, &handler, &metrics).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(handler.seen.lock()[0], sample_event("B1234XYZ", 1_700_000_000));
        assert_eq!(broker.unacked_len(), 0);
        assert_eq!(broker.ready_len(), 0);
        assert_eq!(metrics.events_consumed(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_discarded() {
        let broker = MemoryBroker::new();
        broker.publish_raw(&b"{not json"[..]);

        let mut consumer = broker.subscribe();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        let handler = RecordingHandler::default();
        let metrics = Metrics::new();

        let outcome = process_delivery(&delivery, &handler, &metrics).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Discarded);
        assert!(handler.seen.lock().is_empty());
        assert_eq!(broker.ready_len(), 0);
        assert_eq!(metrics.events_discarded(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_retried_until_attempts_exhausted() {
        let broker = MemoryBroker::new();
        broker.publish(&sample_event("B1234XYZ", 1)).await.unwrap();
        let handler = FlakyHandler { failures: usize::MAX, calls: AtomicUsize::new(0) };
        let metrics = Metrics::new();
        let mut consumer = broker.subscribe();

        for expected_attempts in 0..MAX_HANDLER_ATTEMPTS - 1 {
            let delivery = consumer.next_delivery().await.unwrap().unwrap();
            assert_eq!(delivery.attempts(), expected_attempts);
            let outcome = process_delivery(&delivery, &handler, &metrics).await.unwrap();
            assert_eq!(outcome, DeliveryOutcome::Requeued);
            assert_eq!(broker.ready_len(), 1);
        }

        let last = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(last.attempts(), MAX_HANDLER_ATTEMPTS - 1);
        let outcome = process_delivery(&last, &handler, &metrics).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Discarded);
        assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), MAX_HANDLER_ATTEMPTS as usize);
        assert_eq!(metrics.events_requeued(), u64::from(MAX_HANDLER_ATTEMPTS - 1));
        assert_eq!(metrics.events_discarded(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_redelivery() {
        let broker = MemoryBroker::new();
        broker.publish(&sample_event("B1234XYZ", 1)).await.unwrap();
        let handler = FlakyHandler { failures: 1, calls: AtomicUsize::new(0) };
        let metrics = Metrics::new();
        let mut consumer = broker.subscribe();

        let first = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(process_delivery(&first, &handler, &metrics).await.unwrap(), DeliveryOutcome::Requeued);
        let second = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.attempts(), 1);
        assert_eq!(process_delivery(&second, &handler, &metrics).await.unwrap(), DeliveryOutcome::Acked);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crash_redelivery_then_handler_failure_is_retried() {
        let broker = MemoryBroker::new();
        broker.publish(&sample_event("B1234XYZ", 1_700_000_000)).await.unwrap();

        // Worker takes the message and dies before acknowledging it
        let mut crashed = broker.subscribe();
        let taken = crashed.next_delivery().await.unwrap().unwrap();
        drop(taken);
        drop(crashed);

        let mut restarted = broker.subscribe();
        let redelivered = restarted.next_delivery().await.unwrap().unwrap();
        assert!(redelivered.redelivered());
        assert_eq!(redelivered.attempts(), 0);

        let handler = FlakyHandler { failures: 1, calls: AtomicUsize::new(0) };
        let metrics = Metrics::new();
        let outcome = process_delivery(&redelivered, &handler, &metrics).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Requeued);

        let retried = restarted.next_delivery().await.unwrap().unwrap();
        assert_eq!(process_delivery(&retried, &handler, &metrics).await.unwrap(), DeliveryOutcome::Acked);
        assert_eq!(metrics.events_consumed(), 1);
        assert_eq!(metrics.events_discarded(), 0);
        assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
    }

    #[test]
    fn test_attempt_header_roundtrip() {
        assert_eq!(attempts_from_headers(None), 0);
        assert_eq!(attempts_from_headers(Some(&FieldTable::default())), 0);

        let mut existing = FieldTable::default();
        existing.insert("x-replayed".into(), AMQPValue::Boolean(true));
        let raised = headers_with_attempts(Some(&existing), 2);
        assert_eq!(attempts_from_headers(Some(&raised)), 2);
        assert_eq!(raised.inner().len(), 2);

        let again = headers_with_attempts(Some(&raised), 3);
        assert_eq!(attempts_from_headers(Some(&again)), 3);
        assert_eq!(again.inner().len(), 2);

        let mut signed = FieldTable::default();
        signed.insert(ATTEMPTS_HEADER.into(), AMQPValue::LongInt(-4));
        assert_eq!(attempts_from_headers(Some(&signed)), 0);
    }

    #[tokio::test]
    async fn test_unacked_delivery_redelivered_to_new_consumer() {
        let broker = MemoryBroker::new();
        let event = sample_event("B1234XYZ", 1_700_000_000);
        broker.publish(&event).await.unwrap();

        // Worker takes the message and dies before acknowledging it
        let mut crashed = broker.subscribe();
        let taken = crashed.next_delivery().await.unwrap().unwrap();
        assert_eq!(broker.unacked_len(), 1);
        drop(taken);
        drop(crashed);
        assert_eq!(broker.unacked_len(), 0);

        let mut restarted = broker.subscribe();
        let redelivered = restarted.next_delivery().await.unwrap().unwrap();
        assert!(redelivered.redelivered());

        let handler = RecordingHandler::default();
        let metrics = Metrics::new();
        process_delivery(&redelivered, &handler, &metrics).await.unwrap();
        assert_eq!(handler.seen.lock().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn test_consume_processes_in_order_until_shutdown() {
        let broker = MemoryBroker::new();
        for ts in 1..=3 {
            broker.publish(&sample_event("B1234XYZ", ts)).await.unwrap();
        }

        let handler = Arc::new(RecordingHandler::default());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut consumer = broker.subscribe();

        let task = {
            let handler = handler.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move { consume(&mut consumer, &*handler, &metrics, shutdown_rx).await })
        };

        for _ in 0..100 {
            if metrics.events_consumed() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let timestamps: Vec<i64> = handler.seen.lock().iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(broker.unacked_len(), 0);
    }
}
