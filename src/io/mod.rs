//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT subscriber for vehicle location telemetry
//! - `relay` - Durable AMQP publisher for geofence events
//! - `consumer` - AMQP worker loop with ack-after-handle semantics
//! - `memory_broker` - In-process durable queue implementing the relay and consumer seams
//! - `http_api` - HTTP query API and Prometheus endpoint

pub mod consumer;
pub mod http_api;
pub mod memory_broker;
pub mod mqtt;
pub mod relay;

// Re-export commonly used types
pub use consumer::{consume, AmqpConsumer, ConsumeError, DeliveryOutcome, EventHandler};
pub use memory_broker::MemoryBroker;
pub use mqtt::start_mqtt_subscriber;
pub use relay::{AmqpPublisher, EventPublisher, RelayError};
