//! Synthetic vehicle telemetry for local runs
//!
//! Vehicles start somewhere within ~500 m of the geofence center and take a
//! small random step on every tick. Now and then a vehicle jumps to within a
//! few meters of the center so geofence entries actually happen.

use crate::domain::geofence::GeofenceRegion;
use crate::domain::types::PositionRecord;
use rand::Rng;

/// Initial scatter around the center (degrees, full width)
const START_SPREAD_DEG: f64 = 0.01;
/// Per-tick random step (degrees, full width)
const STEP_DEG: f64 = 0.0001;
/// Jump target spread around the center (degrees, full width)
const JUMP_SPREAD_DEG: f64 = 0.0003;
/// Chance per tick of jumping next to the center
const JUMP_PROBABILITY: f64 = 0.1;

const PLATE_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random Jakarta-style plate: `B` + 1000..=2000 + three letters
pub fn random_plate<R: Rng + ?Sized>(rng: &mut R) -> String {
    let number = rng.gen_range(1000..=2000);
    let suffix: String = (0..3)
        .map(|_| PLATE_LETTERS[rng.gen_range(0..PLATE_LETTERS.len())] as char)
        .collect();
    format!("B{number}{suffix}")
}

/// MQTT topic a vehicle publishes its location on
pub fn location_topic(vehicle_id: &str) -> String {
    format!("/fleet/vehicle/{vehicle_id}/location")
}

/// Random centered offset in `[-width/2, width/2)`
fn jitter<R: Rng + ?Sized>(rng: &mut R, width: f64) -> f64 {
    (rng.gen::<f64>() - 0.5) * width
}

/// Random-walk state for one vehicle
#[derive(Debug, Clone)]
pub struct VehicleWalker {
    vehicle_id: String,
    center_latitude: f64,
    center_longitude: f64,
    latitude: f64,
    longitude: f64,
}

impl VehicleWalker {
    pub fn new<R: Rng + ?Sized>(vehicle_id: impl Into<String>, region: &GeofenceRegion, rng: &mut R) -> Self {
        let center_latitude = region.center_latitude();
        let center_longitude = region.center_longitude();
        Self {
            vehicle_id: vehicle_id.into(),
            center_latitude,
            center_longitude,
            latitude: center_latitude + jitter(rng, START_SPREAD_DEG),
            longitude: center_longitude + jitter(rng, START_SPREAD_DEG),
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Advance one tick and return the new sample
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R, timestamp: i64) -> PositionRecord {
        self.latitude += jitter(rng, STEP_DEG);
        self.longitude += jitter(rng, STEP_DEG);

        if rng.gen::<f64>() < JUMP_PROBABILITY {
            self.latitude = self.center_latitude + jitter(rng, JUMP_SPREAD_DEG);
            self.longitude = self.center_longitude + jitter(rng, JUMP_SPREAD_DEG);
        }

        PositionRecord::new(self.vehicle_id.clone(), self.latitude, self.longitude, timestamp)
    }
}
