//! Embedded MQTT broker for local development (rumqttd)
//!
//! Production deployments point `[mqtt]` at an external broker; with
//! `[broker] embedded = true` the server hosts one itself so the telemetry
//! publisher and the subscriber can run without extra infrastructure.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Largest telemetry payload accepted by the embedded broker (bytes)
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 1024,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: true,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread if enabled in config
///
/// Returns false when disabled or when the bind address is unusable.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_embedded() {
        return false;
    }

    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return false;
        }
    };

    let config = broker_config(listen);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the lifetime of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give broker time to bind before the subscriber connects
    thread::sleep(Duration::from_millis(100));
    info!(addr = %listen, "embedded_broker_started");
    true
}
