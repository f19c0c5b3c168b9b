//! Domain models - core types and pure decision logic
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - `PositionRecord`, `GeofenceEvent` and their wire format
//! - `geofence` - circular region and haversine containment check
//! - `validation` - range checks applied before a record is stored

pub mod geofence;
pub mod types;
pub mod validation;

pub use geofence::{evaluate, haversine_distance_m, GeofenceRegion, RegionError};
pub use types::{EventKind, GeofenceEvent, Location, PositionRecord};
pub use validation::{validate, ValidationError};
