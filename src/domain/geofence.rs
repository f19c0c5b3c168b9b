//! Circular geofence and great-circle containment check

use thiserror::Error;

/// Mean Earth radius used by the haversine formula (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default geofence: Stasiun Bundaran HI, 50 m
pub const DEFAULT_GEOFENCE_LATITUDE: f64 = -6.1938148;
pub const DEFAULT_GEOFENCE_LONGITUDE: f64 = 106.8230342;
pub const DEFAULT_GEOFENCE_RADIUS_M: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegionError {
    #[error("geofence radius must be a positive number of meters, got {0}")]
    InvalidRadius(f64),
    #[error("geofence center out of range: lat={0}, lon={1}")]
    InvalidCenter(f64, f64),
}

/// The single configured geofence
///
/// Built once from configuration and passed by value into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceRegion {
    center_latitude: f64,
    center_longitude: f64,
    radius_m: f64,
}

impl Default for GeofenceRegion {
    fn default() -> Self {
        Self {
            center_latitude: DEFAULT_GEOFENCE_LATITUDE,
            center_longitude: DEFAULT_GEOFENCE_LONGITUDE,
            radius_m: DEFAULT_GEOFENCE_RADIUS_M,
        }
    }
}

impl GeofenceRegion {
    pub fn new(center_latitude: f64, center_longitude: f64, radius_m: f64) -> Result<Self, RegionError> {
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(RegionError::InvalidRadius(radius_m));
        }
        if !(-90.0..=90.0).contains(&center_latitude) || !(-180.0..=180.0).contains(&center_longitude) {
            return Err(RegionError::InvalidCenter(center_latitude, center_longitude));
        }
        Ok(Self { center_latitude, center_longitude, radius_m })
    }

    pub fn center_latitude(&self) -> f64 {
        self.center_latitude
    }

    pub fn center_longitude(&self) -> f64 {
        self.center_longitude
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    /// Distance from the region center to a point (meters)
    pub fn distance_from_center_m(&self, latitude: f64, longitude: f64) -> f64 {
        haversine_distance_m(self.center_latitude, self.center_longitude, latitude, longitude)
    }

    /// True when the point lies inside or exactly on the boundary
    #[inline]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        self.distance_from_center_m(latitude, longitude) <= self.radius_m
    }
}

/// Evaluate whether a coordinate lies inside the region
#[inline]
pub fn evaluate(region: &GeofenceRegion, latitude: f64, longitude: f64) -> bool {
    region.contains(latitude, longitude)
}

/// Great-circle distance between two points in meters (haversine)
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let half_lat = (delta_lat / 2.0).sin();
    let half_lon = (delta_lon / 2.0).sin();
    let a = half_lat * half_lat + lat1_rad.cos() * lat2_rad.cos() * half_lon * half_lon;
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
