//! HTTP query API and Prometheus endpoint
//!
//! Routes:
//! - `GET /health`
//! - `GET /vehicles/{id}/location` - latest stored position
//! - `GET /vehicles/{id}/history?start=&end=` - positions in an inclusive time range
//! - `GET /metrics` - Prometheus text format
//!
//! Store reads run on the blocking pool; hyper serves HTTP/1 connections.

use crate::domain::types::PositionRecord;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::store::{LocationStore, StoreError};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Parsed request target; vehicle ids are percent-decoded
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Metrics,
    Location(Cow<'a, str>),
    History(Cow<'a, str>),
    /// Vehicle id segment that does not decode to UTF-8
    BadVehicleId,
    NotFound,
}

fn parse_route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    if method != Method::GET {
        return Route::NotFound;
    }
    match path {
        "/health" => return Route::Health,
        "/metrics" => return Route::Metrics,
        _ => {}
    }
    let Some(rest) = path.strip_prefix("/vehicles/") else {
        return Route::NotFound;
    };
    let (id, resource) = match rest.split_once('/') {
        Some((id, resource @ ("location" | "history"))) if !id.is_empty() => (id, resource),
        _ => return Route::NotFound,
    };
    let Ok(id) = percent_decode_str(id).decode_utf8() else {
        return Route::BadVehicleId;
    };
    if resource == "location" {
        Route::Location(id)
    } else {
        Route::History(id)
    }
}

/// Parse `start` and `end` (epoch seconds) from a query string
fn parse_time_range(query: Option<&str>) -> Result<(i64, i64), &'static str> {
    let mut start = None;
    let mut end = None;
    for pair in query.unwrap_or_default().split('&') {
        match pair.split_once('=') {
            Some(("start", value)) => start = Some(value),
            Some(("end", value)) => end = Some(value),
            _ => {}
        }
    }

    let (Some(start), Some(end)) = (start, end) else {
        return Err("start and end query parameters are required");
    };
    let start: i64 = start.parse().map_err(|_| "invalid start timestamp")?;
    let end: i64 = end.parse().map_err(|_| "invalid end timestamp")?;
    if start > end {
        return Err("start must not be after end");
    }
    Ok((start, end))
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "application/json", r#"{"error":"internal error"}"#)
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Run a store read on the blocking pool
async fn with_store<S, T, F>(store: &Arc<S>, f: F) -> Result<T, StoreError>
where
    S: LocationStore + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
}

async fn latest_location<S: LocationStore + 'static>(store: &Arc<S>, vehicle_id: &str) -> Response<Full<Bytes>> {
    let id = vehicle_id.to_string();
    match with_store(store, move |s| s.latest(&id)).await {
        Ok(Some(record)) => json_response(StatusCode::OK, &record),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "vehicle not found"),
        Err(e) => {
            error!(vehicle_id = %vehicle_id, error = %e, "location_query_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to query location")
        }
    }
}

async fn location_history<S: LocationStore + 'static>(
    store: &Arc<S>,
    vehicle_id: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let (start, end) = match parse_time_range(query) {
        Ok(range) => range,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    let id = vehicle_id.to_string();
    match with_store(store, move |s| s.history(&id, start, end)).await {
        Ok(records) => json_response::<[PositionRecord]>(StatusCode::OK, &records),
        Err(e) => {
            error!(vehicle_id = %vehicle_id, error = %e, "history_query_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to query history")
        }
    }
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Expects a cumulative summary from `Metrics::scrape`.
fn format_prometheus_metrics(summary: &MetricsSummary) -> String {
    let mut output = String::with_capacity(4096);

    let counters: [(&str, &str, u64); 12] = [
        ("fleet_positions_received_total", "Location messages received", summary.positions_received),
        ("fleet_positions_malformed_total", "Location payloads that failed to decode", summary.positions_malformed),
        ("fleet_positions_invalid_total", "Location records rejected by validation", summary.positions_invalid),
        ("fleet_positions_stored_total", "Location records persisted", summary.positions_stored),
        ("fleet_store_failures_total", "Failed location writes", summary.store_failures),
        ("fleet_geofence_hits_total", "Stored records inside the geofence", summary.geofence_hits),
        ("fleet_events_relayed_total", "Geofence events confirmed by the broker", summary.events_relayed),
        ("fleet_relay_failures_total", "Geofence events that failed to publish", summary.relay_failures),
        ("fleet_events_consumed_total", "Geofence events handled and acknowledged", summary.events_consumed),
        ("fleet_events_discarded_total", "Deliveries rejected without requeue", summary.events_discarded),
        ("fleet_events_requeued_total", "Handler failures queued for another attempt", summary.events_requeued),
        ("fleet_mqtt_client_errors_total", "MQTT acks or subscribes that could not be queued", summary.mqtt_client_errors),
    ];
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, MetricType::Counter, val);
    }

    let _ = writeln!(output, "# HELP fleet_positions_per_sec Records through the pipeline per second since start");
    let _ = writeln!(output, "# TYPE fleet_positions_per_sec gauge");
    let _ = writeln!(output, "fleet_positions_per_sec {:.2}", summary.positions_per_sec);

    write_histogram(
        &mut output,
        "fleet_ingest_latency_us",
        "Ingest latency (validate to relay) in microseconds",
        &summary.lat_buckets,
        summary.ingest_latency_sum_us,
    );
    write_metric(
        &mut output,
        "fleet_ingest_latency_p99_us",
        "99th percentile ingest latency",
        MetricType::Gauge,
        summary.lat_p99_us,
    );
    write_metric(
        &mut output,
        "fleet_ingest_latency_max_us",
        "Maximum ingest latency since start",
        MetricType::Gauge,
        summary.max_ingest_latency_us,
    );

    output
}

async fn route<S: LocationStore + 'static>(
    method: &Method,
    path: &str,
    query: Option<&str>,
    store: &Arc<S>,
    metrics: &Metrics,
) -> Response<Full<Bytes>> {
    match parse_route(method, path) {
        Route::Health => json_response(StatusCode::OK, &serde_json::json!({ "status": "healthy" })),
        Route::Metrics => {
            response(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, format_prometheus_metrics(&metrics.scrape()))
        }
        Route::Location(id) => latest_location(store, &id).await,
        Route::History(id) => location_history(store, &id, query).await,
        Route::BadVehicleId => error_response(StatusCode::BAD_REQUEST, "invalid vehicle id"),
        Route::NotFound => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

async fn handle_request<S: LocationStore + 'static>(
    req: Request<hyper::body::Incoming>,
    store: Arc<S>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let resp = route(req.method(), req.uri().path(), req.uri().query(), &store, &metrics).await;
    debug!(method = %req.method(), path = %req.uri().path(), status = %resp.status().as_u16(), "http_request");
    Ok(resp)
}

/// Start the HTTP API server
pub async fn start_http_server<S: LocationStore + 'static>(
    addr: SocketAddr,
    store: Arc<S>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => {
                        let io = TokioIo::new(stream);
                        let store = store.clone();
                        let metrics = metrics.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, store.clone(), metrics.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
