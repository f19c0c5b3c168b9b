//! Infrastructure - configuration, metrics, logging and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, env overrides)
//! - `metrics` - Lock-free metrics collection
//! - `logging` - tracing subscriber setup
//! - `broker` - Embedded MQTT broker (rumqttd) for local development

pub mod broker;
pub mod config;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use metrics::{Metrics, MetricsSummary};
