//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! The latency histogram is kept twice. The periodic copy is swapped to zero
//! by `report()` for the log reporter; the cumulative copy is never reset and
//! backs the Prometheus exporter through `scrape()`.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (slot, bucket) in result.iter_mut().zip(buckets.iter()) {
        *slot = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (count, bound) in buckets.iter().zip(BUCKET_UPPER_BOUNDS.iter()) {
        cumulative += count;
        if cumulative >= target {
            return *bound;
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot;
/// `scrape()` reads without resetting anything.
pub struct Metrics {
    /// MQTT messages received (monotonic)
    positions_received: AtomicU64,
    /// Payloads that failed to decode (monotonic)
    positions_malformed: AtomicU64,
    /// Records rejected by validation (monotonic)
    positions_invalid: AtomicU64,
    /// Records durably stored (monotonic)
    positions_stored: AtomicU64,
    /// Store writes that failed (monotonic)
    store_failures: AtomicU64,
    /// Stored records inside the geofence (monotonic)
    geofence_hits: AtomicU64,
    /// Events confirmed by the broker (monotonic)
    events_relayed: AtomicU64,
    /// Events lost to publish failure or timeout (monotonic)
    relay_failures: AtomicU64,
    /// Events handled and acknowledged by the worker (monotonic)
    events_consumed: AtomicU64,
    /// Deliveries rejected without requeue (monotonic)
    events_discarded: AtomicU64,
    /// Handler failures queued for another attempt (monotonic)
    events_requeued: AtomicU64,
    /// MQTT client requests (ack, subscribe) that could not be queued (monotonic)
    mqtt_client_errors: AtomicU64,
    /// Records processed since last report (reset on report)
    ingested_since_report: AtomicU64,
    /// Sum of ingest latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max ingest latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Ingest latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Records processed since start (monotonic)
    ingested_total: AtomicU64,
    /// Sum of ingest latencies since start in microseconds (monotonic)
    latency_sum_total_us: AtomicU64,
    /// Max ingest latency since start in microseconds
    latency_max_total_us: AtomicU64,
    /// Ingest latency histogram buckets since start (monotonic)
    latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    started: Instant,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            positions_received: AtomicU64::new(0),
            positions_malformed: AtomicU64::new(0),
            positions_invalid: AtomicU64::new(0),
            positions_stored: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            geofence_hits: AtomicU64::new(0),
            events_relayed: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            events_consumed: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            events_requeued: AtomicU64::new(0),
            mqtt_client_errors: AtomicU64::new(0),
            ingested_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            ingested_total: AtomicU64::new(0),
            latency_sum_total_us: AtomicU64::new(0),
            latency_max_total_us: AtomicU64::new(0),
            latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            started: Instant::now(),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_position_received(&self) {
        self.positions_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_malformed(&self) {
        self.positions_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_invalid(&self) {
        self.positions_invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_stored(&self) {
        self.positions_stored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_geofence_hit(&self) {
        self.geofence_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_relayed(&self) {
        self.events_relayed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_consumed(&self) {
        self.events_consumed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_discarded(&self) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_requeued(&self) {
        self.events_requeued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mqtt_client_error(&self) {
        self.mqtt_client_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one pass through the ingest pipeline (lock-free)
    #[inline]
    pub fn record_ingest_latency(&self, latency_us: u64) {
        self.ingested_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);

        self.ingested_total.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_total_us, latency_us);
    }

    pub fn positions_received(&self) -> u64 {
        self.positions_received.load(Ordering::Relaxed)
    }

    pub fn positions_malformed(&self) -> u64 {
        self.positions_malformed.load(Ordering::Relaxed)
    }

    pub fn positions_invalid(&self) -> u64 {
        self.positions_invalid.load(Ordering::Relaxed)
    }

    pub fn positions_stored(&self) -> u64 {
        self.positions_stored.load(Ordering::Relaxed)
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn geofence_hits(&self) -> u64 {
        self.geofence_hits.load(Ordering::Relaxed)
    }

    pub fn events_relayed(&self) -> u64 {
        self.events_relayed.load(Ordering::Relaxed)
    }

    pub fn relay_failures(&self) -> u64 {
        self.relay_failures.load(Ordering::Relaxed)
    }

    pub fn events_consumed(&self) -> u64 {
        self.events_consumed.load(Ordering::Relaxed)
    }

    pub fn events_discarded(&self) -> u64 {
        self.events_discarded.load(Ordering::Relaxed)
    }

    pub fn events_requeued(&self) -> u64 {
        self.events_requeued.load(Ordering::Relaxed)
    }

    pub fn mqtt_client_errors(&self) -> u64 {
        self.mqtt_client_errors.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let ingested = self.ingested_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        self.summary(ingested, latency_sum, max_latency, lat_buckets, elapsed.as_secs_f64())
    }

    /// Summary over the whole process lifetime, for the Prometheus exporter
    ///
    /// Reads only; histogram and counters never go down between calls.
    pub fn scrape(&self) -> MetricsSummary {
        self.summary(
            self.ingested_total.load(Ordering::Relaxed),
            self.latency_sum_total_us.load(Ordering::Relaxed),
            self.latency_max_total_us.load(Ordering::Relaxed),
            load_buckets(&self.latency_buckets_total),
            self.started.elapsed().as_secs_f64(),
        )
    }

    fn summary(
        &self,
        ingested: u64,
        latency_sum: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
        elapsed_secs: f64,
    ) -> MetricsSummary {
        let positions_per_sec = if elapsed_secs > 0.0 { ingested as f64 / elapsed_secs } else { 0.0 };
        let avg_latency = if ingested > 0 { latency_sum / ingested } else { 0 };

        MetricsSummary {
            positions_received: self.positions_received(),
            positions_malformed: self.positions_malformed(),
            positions_invalid: self.positions_invalid(),
            positions_stored: self.positions_stored(),
            store_failures: self.store_failures(),
            geofence_hits: self.geofence_hits(),
            events_relayed: self.events_relayed(),
            relay_failures: self.relay_failures(),
            events_consumed: self.events_consumed(),
            events_discarded: self.events_discarded(),
            events_requeued: self.events_requeued(),
            mqtt_client_errors: self.mqtt_client_errors(),
            positions_per_sec,
            ingest_latency_sum_us: latency_sum,
            avg_ingest_latency_us: avg_latency,
            max_ingest_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

/// Point-in-time metrics snapshot
///
/// Latency fields cover the window of the call that built it: the interval
/// since the last `report()`, or the whole lifetime for `scrape()`.
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub positions_received: u64,
    pub positions_malformed: u64,
    pub positions_invalid: u64,
    pub positions_stored: u64,
    pub store_failures: u64,
    pub geofence_hits: u64,
    pub events_relayed: u64,
    pub relay_failures: u64,
    pub events_consumed: u64,
    pub events_discarded: u64,
    pub events_requeued: u64,
    pub mqtt_client_errors: u64,
    /// Records through the pipeline per second over the summary window
    pub positions_per_sec: f64,
    pub ingest_latency_sum_us: u64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Ingest latency histogram buckets (same bounds as `METRICS_BUCKET_BOUNDS`)
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            received = %self.positions_received,
            stored = %self.positions_stored,
            invalid = %self.positions_invalid,
            malformed = %self.positions_malformed,
            store_failures = %self.store_failures,
            geofence_hits = %self.geofence_hits,
            relayed = %self.events_relayed,
            relay_failures = %self.relay_failures,
            mqtt_client_errors = %self.mqtt_client_errors,
            positions_per_sec = format!("{:.1}", self.positions_per_sec),
            avg_latency_us = %self.avg_ingest_latency_us,
            p99_us = %self.lat_p99_us,
            "metrics"
        );
    }

    /// Worker-side counters only
    pub fn log_consumer(&self) {
        info!(
            consumed = %self.events_consumed,
            discarded = %self.events_discarded,
            requeued = %self.events_requeued,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.positions_received(), 0);
        assert_eq!(metrics.events_relayed(), 0);
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.record_position_received();
        metrics.record_position_received();
        metrics.record_position_invalid();
        metrics.record_geofence_hit();
        metrics.record_relay_failure();

        assert_eq!(metrics.positions_received(), 2);
        assert_eq!(metrics.positions_invalid(), 1);
        assert_eq!(metrics.geofence_hits(), 1);
        assert_eq!(metrics.relay_failures(), 1);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(100_000), 10);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_position_stored();
        metrics.record_ingest_latency(150);
        metrics.record_ingest_latency(250);

        let summary = metrics.report();
        assert_eq!(summary.avg_ingest_latency_us, 200);
        assert_eq!(summary.max_ingest_latency_us, 250);
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(summary.positions_stored, 1);

        // Periodic values reset, monotonic counters stay
        let summary = metrics.report();
        assert_eq!(summary.avg_ingest_latency_us, 0);
        assert_eq!(summary.lat_buckets.iter().sum::<u64>(), 0);
        assert_eq!(summary.positions_stored, 1);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[0] = 90;
        buckets[5] = 10;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 100);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 3200);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_scrape_is_cumulative_and_ignores_report() {
        let metrics = Metrics::new();
        metrics.record_ingest_latency(150);
        metrics.record_ingest_latency(90_000);

        let first = metrics.scrape();
        assert_eq!(first.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(first.ingest_latency_sum_us, 90_150);

        // The log reporter drains its own window only
        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 2);
        metrics.record_ingest_latency(300);

        let second = metrics.scrape();
        assert_eq!(second.lat_buckets.iter().sum::<u64>(), 3);
        assert_eq!(second.ingest_latency_sum_us, 90_450);
        assert_eq!(second.max_ingest_latency_us, 90_000);
        for (before, after) in first.lat_buckets.iter().zip(second.lat_buckets.iter()) {
            assert!(after >= before);
        }

        let window = metrics.report();
        assert_eq!(window.lat_buckets.iter().sum::<u64>(), 1);
        assert_eq!(window.max_ingest_latency_us, 300);
    }
}
