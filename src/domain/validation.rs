//! Structural and range validation of inbound position records

use crate::domain::types::PositionRecord;
use thiserror::Error;

/// Why a position record was rejected
///
/// Rejections are expected noise from the field: the message is dropped,
/// logged and counted, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("vehicle_id is required")]
    MissingVehicleId,
    #[error("invalid latitude: {0}")]
    LatitudeOutOfRange(f64),
    #[error("invalid longitude: {0}")]
    LongitudeOutOfRange(f64),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

impl ValidationError {
    /// Short label for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingVehicleId => "missing_vehicle_id",
            ValidationError::LatitudeOutOfRange(_) => "latitude_out_of_range",
            ValidationError::LongitudeOutOfRange(_) => "longitude_out_of_range",
            ValidationError::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Validate a record, returning the first failed check
pub fn validate(record: &PositionRecord) -> Result<(), ValidationError> {
    if record.vehicle_id.is_empty() {
        return Err(ValidationError::MissingVehicleId);
    }
    // NaN fails `contains`, so it is rejected as out of range
    if !(-90.0..=90.0).contains(&record.latitude) {
        return Err(ValidationError::LatitudeOutOfRange(record.latitude));
    }
    if !(-180.0..=180.0).contains(&record.longitude) {
        return Err(ValidationError::LongitudeOutOfRange(record.longitude));
    }
    if record.timestamp <= 0 {
        return Err(ValidationError::InvalidTimestamp(record.timestamp));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(vehicle_id: &str, latitude: f64, longitude: f64, timestamp: i64) -> PositionRecord {
        PositionRecord::new(vehicle_id, latitude, longitude, timestamp)
    }

    #[test]
    fn test_accepts_valid_record() {
        assert_eq!(validate(&record("B1234XYZ", -6.19, 106.82, 1715000000)), Ok(()));
    }

    #[test]
    fn test_accepts_inclusive_bounds() {
        assert_eq!(validate(&record("B1", -90.0, 180.0, 1)), Ok(()));
        assert_eq!(validate(&record("B1", 90.0, -180.0, 1)), Ok(()));
    }

    #[test]
    fn test_rejects_empty_vehicle_id() {
        assert_eq!(validate(&record("", 0.0, 0.0, 1)), Err(ValidationError::MissingVehicleId));
    }

    #[test]
    fn test_rejects_latitude_out_of_range() {
        assert_eq!(
            validate(&record("B1", 90.0001, 0.0, 1)),
            Err(ValidationError::LatitudeOutOfRange(90.0001))
        );
        assert!(validate(&record("B1", -90.0001, 0.0, 1)).is_err());
    }

    #[test]
    fn test_rejects_longitude_out_of_range() {
        assert_eq!(
            validate(&record("B1", 0.0, -180.0001, 1)),
            Err(ValidationError::LongitudeOutOfRange(-180.0001))
        );
        assert!(validate(&record("B1", 0.0, 180.0001, 1)).is_err());
    }

    #[test]
    fn test_rejects_non_positive_timestamp() {
        assert_eq!(validate(&record("B1", 0.0, 0.0, 0)), Err(ValidationError::InvalidTimestamp(0)));
        assert!(validate(&record("B1", 0.0, 0.0, -1)).is_err());
    }

    #[test]
    fn test_rejects_nan_coordinates() {
        assert!(matches!(
            validate(&record("B1", f64::NAN, 0.0, 1)),
            Err(ValidationError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            validate(&record("B1", 0.0, f64::NAN, 1)),
            Err(ValidationError::LongitudeOutOfRange(_))
        ));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ValidationError::MissingVehicleId.kind(), "missing_vehicle_id");
        assert_eq!(ValidationError::InvalidTimestamp(0).kind(), "invalid_timestamp");
    }
}
