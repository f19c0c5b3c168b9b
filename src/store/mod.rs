//! Position storage
//!
//! - `LocationStore` - append-and-query interface used by the pipeline and HTTP API
//! - `sqlite` - SQLite-backed implementation (one append-only table)
//! - `schema` - DDL and connection pragmas

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteLocationStore;

use crate::domain::types::PositionRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable append-and-query store for position records
///
/// Calls are synchronous; implementations serialize access to their handle
/// internally so a single instance can be shared behind an `Arc`.
pub trait LocationStore: Send + Sync {
    /// Durably insert a record. Must succeed before any geofence event for it is relayed.
    fn save(&self, record: &PositionRecord) -> Result<(), StoreError>;

    /// Most recent record for the vehicle by stored timestamp
    fn latest(&self, vehicle_id: &str) -> Result<Option<PositionRecord>, StoreError>;

    /// Records with `start <= timestamp <= end`, oldest first
    fn history(&self, vehicle_id: &str, start: i64, end: i64) -> Result<Vec<PositionRecord>, StoreError>;
}

impl<T: LocationStore + ?Sized> LocationStore for std::sync::Arc<T> {
    fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }

    fn latest(&self, vehicle_id: &str) -> Result<Option<PositionRecord>, StoreError> {
        (**self).latest(vehicle_id)
    }

    fn history(&self, vehicle_id: &str, start: i64, end: i64) -> Result<Vec<PositionRecord>, StoreError> {
        (**self).history(vehicle_id, start, end)
    }
}
