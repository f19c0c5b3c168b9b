//! Shared types for the fleet geofence pipeline

use serde::{Deserialize, Serialize};

/// One telemetry sample for one vehicle, exactly as received from the transport
///
/// Records are never deduplicated: a redelivered MQTT message produces a second
/// record with identical fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Unix epoch seconds as reported by the vehicle
    pub timestamp: i64,
}

impl PositionRecord {
    pub fn new(vehicle_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self { vehicle_id: vehicle_id.into(), latitude, longitude, timestamp }
    }
}

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Kind of geofence transition carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "geofence_entry")]
    Entry,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "geofence_entry",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event relayed to the durable broker when a stored position lies inside the geofence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub vehicle_id: String,
    pub event: EventKind,
    pub location: Location,
    pub timestamp: i64,
}

impl GeofenceEvent {
    /// Build an entry event mirroring a stored position
    pub fn entry(record: &PositionRecord) -> Self {
        Self {
            vehicle_id: record.vehicle_id.clone(),
            event: EventKind::Entry,
            location: Location { latitude: record.latitude, longitude: record.longitude },
            timestamp: record.timestamp,
        }
    }
}
