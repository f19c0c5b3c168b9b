use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::domain::types::PositionRecord;
use crate::store::{schema, LocationStore, StoreError};

/// SQLite-backed position store.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
pub struct SqliteLocationStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteLocationStore {
    /// Open or create a database at the given path and bootstrap the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(&conn)?;

        info!(path = %path.display(), "store_opened");

        Ok(Self { conn: Mutex::new(conn), path: path.to_owned() })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn), path: PathBuf::from(":memory:") })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [schema::SCHEMA_VERSION])
                .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of stored records
    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vehicle_locations", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRecord> {
    Ok(PositionRecord {
        vehicle_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

impl LocationStore for SqliteLocationStore {
    fn save(&self, record: &PositionRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vehicle_locations (vehicle_id, latitude, longitude, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.vehicle_id, record.latitude, record.longitude, record.timestamp],
        )?;
        debug!(vehicle_id = %record.vehicle_id, timestamp = %record.timestamp, "store_insert");
        Ok(())
    }

    fn latest(&self, vehicle_id: &str) -> Result<Option<PositionRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT vehicle_id, latitude, longitude, timestamp
                 FROM vehicle_locations
                 WHERE vehicle_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT 1",
                [vehicle_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn history(&self, vehicle_id: &str, start: i64, end: i64) -> Result<Vec<PositionRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT vehicle_id, latitude, longitude, timestamp
             FROM vehicle_locations
             WHERE vehicle_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let records = stmt
            .query_map(params![vehicle_id, start, end], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
