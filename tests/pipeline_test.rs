//! End-to-end pipeline tests: ingest -> store -> geofence -> queue -> worker
//!
//! The durable queue is the in-memory broker; the store is a SQLite file.

use async_trait::async_trait;
use fleet_geofence::domain::{EventKind, GeofenceEvent, GeofenceRegion, PositionRecord};
use fleet_geofence::infra::Metrics;
use fleet_geofence::io::consumer::{process_delivery, DeliverySource};
use fleet_geofence::io::{DeliveryOutcome, EventHandler, MemoryBroker};
use fleet_geofence::services::{IngestOutcome, Ingestor, LocationHandler};
use fleet_geofence::store::{LocationStore, SqliteLocationStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CollectingHandler {
    events: Mutex<Vec<GeofenceEvent>>,
    fail_next: AtomicBool,
}

#[async_trait]
impl EventHandler for CollectingHandler {
    async fn handle(&self, event: &GeofenceEvent) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("alert sink down");
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

fn file_store(dir: &tempfile::TempDir) -> Arc<SqliteLocationStore> {
    Arc::new(SqliteLocationStore::open(&dir.path().join("fleet.db")).unwrap())
}

#[tokio::test]
async fn test_jakarta_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir);
    let broker = MemoryBroker::new();
    let metrics = Arc::new(Metrics::new());
    let ingestor = Ingestor::new(store.clone(), broker.clone(), GeofenceRegion::default(), metrics.clone());

    // ~1 m from Bundaran HI, then ~8.6 km away
    let inside = PositionRecord::new("B1234XYZ", -6.19381, 106.82303, 1_715_000_000);
    let outside = PositionRecord::new("B1234XYZ", -6.2, 106.9, 1_715_000_002);

    assert!(matches!(ingestor.on_location(inside.clone()).await, IngestOutcome::Relayed(_)));
    assert!(matches!(ingestor.on_location(outside.clone()).await, IngestOutcome::Suppressed));

    // Both stored, latest is the outside sample
    assert_eq!(store.latest("B1234XYZ").unwrap(), Some(outside.clone()));
    assert_eq!(store.history("B1234XYZ", 0, i64::MAX).unwrap(), vec![inside.clone(), outside]);

    // Exactly one event on the queue, consumed and acknowledged by the worker
    assert_eq!(broker.ready_len(), 1);
    let handler = CollectingHandler::default();
    let mut consumer = broker.subscribe();
    let delivery = consumer.next_delivery().await.unwrap().unwrap();
    assert_eq!(process_delivery(&delivery, &handler, &metrics).await.unwrap(), DeliveryOutcome::Acked);

    let events = handler.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].vehicle_id, "B1234XYZ");
    assert_eq!(events[0].event, EventKind::Entry);
    assert_eq!(events[0].location.latitude, inside.latitude);
    assert_eq!(events[0].location.longitude, inside.longitude);
    assert_eq!(events[0].timestamp, inside.timestamp);
    assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
}

#[tokio::test]
async fn test_handler_failure_is_redelivered_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let metrics = Arc::new(Metrics::new());
    let ingestor = Ingestor::new(file_store(&dir), broker.clone(), GeofenceRegion::default(), metrics.clone());

    ingestor.on_location(PositionRecord::new("B1500ABC", -6.1938148, 106.8230342, 1_715_000_000)).await;

    let handler = CollectingHandler::default();
    handler.fail_next.store(true, Ordering::SeqCst);
    let mut consumer = broker.subscribe();

    let first = consumer.next_delivery().await.unwrap().unwrap();
    assert_eq!(process_delivery(&first, &handler, &metrics).await.unwrap(), DeliveryOutcome::Requeued);

    let second = consumer.next_delivery().await.unwrap().unwrap();
    assert_eq!(process_delivery(&second, &handler, &metrics).await.unwrap(), DeliveryOutcome::Acked);
    assert_eq!(handler.events.lock().len(), 1);
    assert_eq!(metrics.events_requeued(), 1);
    assert_eq!(metrics.events_consumed(), 1);
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    {
        let ingestor =
            Ingestor::new(file_store(&dir), broker.clone(), GeofenceRegion::default(), Arc::new(Metrics::new()));
        ingestor.on_location(PositionRecord::new("B1234XYZ", -6.2, 106.9, 1_715_000_000)).await;
    }

    let reopened = file_store(&dir);
    assert_eq!(reopened.latest("B1234XYZ").unwrap().map(|r| r.timestamp), Some(1_715_000_000));
}
