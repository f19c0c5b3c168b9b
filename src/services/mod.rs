//! Services - business logic
//!
//! - `ingest` - Validate, persist, evaluate and relay each position record
//! - `telemetry_sim` - Random-walk vehicle generator used by the publisher binary

pub mod ingest;
pub mod telemetry_sim;

// Re-export commonly used types
pub use ingest::{IngestOutcome, Ingestor, LocationHandler};
