//! Per-message ingest pipeline: validate -> persist -> evaluate -> relay
//!
//! Each stage gates the next. Nothing is retried here: a record that fails
//! validation or persistence is dropped, and a failed relay is reported but
//! never causes the record to be stored again or re-evaluated.

use crate::domain::geofence::GeofenceRegion;
use crate::domain::types::{GeofenceEvent, PositionRecord};
use crate::domain::validation::{validate, ValidationError};
use crate::infra::metrics::Metrics;
use crate::io::relay::{EventPublisher, RelayError};
use crate::store::{LocationStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal state of one position record
#[derive(Debug)]
pub enum IngestOutcome {
    /// Rejected before persistence
    Invalid(ValidationError),
    /// Persistence failed; the geofence check was skipped
    StoreFailed(StoreError),
    /// Stored, outside the geofence
    Suppressed,
    /// Stored, inside the geofence, event confirmed by the broker
    Relayed(GeofenceEvent),
    /// Stored, inside the geofence, event could not be relayed
    RelayFailed { event: GeofenceEvent, error: RelayError },
}

impl IngestOutcome {
    /// True when the record reached the store
    pub fn is_stored(&self) -> bool {
        !matches!(self, IngestOutcome::Invalid(_) | IngestOutcome::StoreFailed(_))
    }
}

/// Inbound seam called once per decoded position
#[async_trait]
pub trait LocationHandler: Send + Sync {
    async fn on_location(&self, record: PositionRecord) -> IngestOutcome;
}

#[async_trait]
impl<T: LocationHandler + ?Sized> LocationHandler for Arc<T> {
    async fn on_location(&self, record: PositionRecord) -> IngestOutcome {
        (**self).on_location(record).await
    }
}

/// Ingest pipeline over a store and an event publisher
pub struct Ingestor<S, P> {
    store: Arc<S>,
    publisher: P,
    region: GeofenceRegion,
    metrics: Arc<Metrics>,
}

impl<S, P> Ingestor<S, P>
where
    S: LocationStore + 'static,
    P: EventPublisher,
{
    pub fn new(store: Arc<S>, publisher: P, region: GeofenceRegion, metrics: Arc<Metrics>) -> Self {
        Self { store, publisher, region, metrics }
    }

    pub fn region(&self) -> &GeofenceRegion {
        &self.region
    }

    /// SQLite calls block, so they run on the blocking pool
    async fn persist(&self, record: &PositionRecord) -> Result<(), StoreError> {
        let store = self.store.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
    }

    async fn process(&self, record: PositionRecord) -> IngestOutcome {
        if let Err(e) = validate(&record) {
            warn!(vehicle_id = %record.vehicle_id, reason = %e.kind(), error = %e, "position_invalid");
            self.metrics.record_position_invalid();
            return IngestOutcome::Invalid(e);
        }

        if let Err(e) = self.persist(&record).await {
            error!(vehicle_id = %record.vehicle_id, timestamp = %record.timestamp, error = %e, "position_store_failed");
            self.metrics.record_store_failure();
            return IngestOutcome::StoreFailed(e);
        }
        self.metrics.record_position_stored();
        debug!(
            vehicle_id = %record.vehicle_id,
            lat = %record.latitude,
            lon = %record.longitude,
            timestamp = %record.timestamp,
            "position_stored"
        );

        if !self.region.contains(record.latitude, record.longitude) {
            return IngestOutcome::Suppressed;
        }
        self.metrics.record_geofence_hit();

        let event = GeofenceEvent::entry(&record);
        match self.publisher.publish(&event).await {
            Ok(()) => {
                self.metrics.record_event_relayed();
                info!(
                    vehicle_id = %event.vehicle_id,
                    lat = %event.location.latitude,
                    lon = %event.location.longitude,
                    timestamp = %event.timestamp,
                    "geofence_entry_relayed"
                );
                IngestOutcome::Relayed(event)
            }
            Err(e) => {
                self.metrics.record_relay_failure();
                // Full event in the log line; nothing else will carry it downstream
                error!(
                    error = %e,
                    event = %serde_json::to_string(&event).unwrap_or_default(),
                    "relay_publish_failed"
                );
                IngestOutcome::RelayFailed { event, error: e }
            }
        }
    }
}

#[async_trait]
impl<S, P> LocationHandler for Ingestor<S, P>
where
    S: LocationStore + 'static,
    P: EventPublisher,
{
    async fn on_location(&self, record: PositionRecord) -> IngestOutcome {
        let start = Instant::now();
        let outcome = self.process(record).await;
        if outcome.is_stored() {
            self.metrics.record_ingest_latency(start.elapsed().as_micros() as u64);
        }
        outcome
    }
}
