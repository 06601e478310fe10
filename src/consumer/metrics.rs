//! Prometheus metrics for leasing and consumption.
//!
//! Metrics cover:
//! - Partition ownership (owned partitions, fair share, lease operations)
//! - Consumption throughput (events processed, batch sizes)
//! - Checkpointing (writes by status, latency)
//! - Worker lifecycle (exits by outcome)
//! - Infrastructure (retries, store failures, dropped telemetry)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "leasehold" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully: if a metric fails to register,
//! an unregistered metric is returned instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for leasehold metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("leasehold".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Ownership metrics
// =============================================================================

define_gauge!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Number of partitions this process currently leases"
);
define_gauge!(
    FAIR_SHARE,
    "fair_share",
    "Target number of partitions for this process in the last balance cycle"
);
define_counter_vec!(
    LEASE_OPERATIONS,
    "lease_operations_total",
    "Total number of lease operations",
    ["operation", "status"]
);

// =============================================================================
// Consumption metrics
// =============================================================================

define_counter_vec!(
    EVENTS_PROCESSED,
    "events_processed_total",
    "Total number of events handed to the event handler",
    ["partition"]
);
define_histogram_vec!(
    BATCH_SIZE,
    "batch_size",
    "Number of events per received batch",
    ["partition"],
    [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
);

// =============================================================================
// Checkpoint metrics
// =============================================================================

define_counter_vec!(
    CHECKPOINT_WRITES,
    "checkpoint_writes_total",
    "Total number of checkpoint writes",
    ["status"]
);
define_histogram_vec!(
    CHECKPOINT_DURATION,
    "checkpoint_duration_seconds",
    "Checkpoint write duration in seconds, including retries",
    ["status"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
);

// =============================================================================
// Worker and infrastructure metrics
// =============================================================================

define_counter_vec!(
    WORKER_EXITS,
    "worker_exits_total",
    "Total number of partition worker exits",
    ["outcome"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Total number of retry attempts",
    ["policy", "result"]
);
define_counter_vec!(
    STORE_FAILURES,
    "store_failures_total",
    "Total number of lease or checkpoint store failures",
    ["operation"]
);
define_counter_vec!(
    ERRORS,
    "errors_total",
    "Total number of errors by kind",
    ["kind"]
);
define_counter!(
    TELEMETRY_DROPPED,
    "telemetry_dropped_total",
    "Telemetry events dropped because the sink was full or closed"
);

// =============================================================================
// Safe Registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they appear in scrapes before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*OWNED_PARTITIONS;
    let _ = &*FAIR_SHARE;
    let _ = &*LEASE_OPERATIONS;
    let _ = &*EVENTS_PROCESSED;
    let _ = &*BATCH_SIZE;
    let _ = &*CHECKPOINT_WRITES;
    let _ = &*CHECKPOINT_DURATION;
    let _ = &*WORKER_EXITS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*STORE_FAILURES;
    let _ = &*ERRORS;
    let _ = &*TELEMETRY_DROPPED;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording Helpers
// =============================================================================

/// Record a lease operation (`acquire`, `renew`, `release`) and its status.
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a processed batch.
pub fn record_batch(partition: &str, events: usize) {
    EVENTS_PROCESSED
        .with_label_values(&[partition])
        .inc_by(events as u64);
    BATCH_SIZE
        .with_label_values(&[partition])
        .observe(events as f64);
}

/// Record a checkpoint write attempt sequence.
pub fn record_checkpoint(status: &str, duration_secs: f64) {
    CHECKPOINT_WRITES.with_label_values(&[status]).inc();
    CHECKPOINT_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_worker_exit(outcome: &str) {
    WORKER_EXITS.with_label_values(&[outcome]).inc();
}

pub fn record_store_failure(operation: &str) {
    STORE_FAILURES.with_label_values(&[operation]).inc();
}

pub fn record_error(kind: &str) {
    ERRORS.with_label_values(&[kind]).inc();
}

pub fn set_owned_partitions(count: usize) {
    OWNED_PARTITIONS.set(count as i64);
}

pub fn set_fair_share(count: usize) {
    FAIR_SHARE.set(count as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Metric Recording Helper Tests
    // ========================================================================

    #[test]
    fn test_record_lease_operation() {
        let before = LEASE_OPERATIONS
            .with_label_values(&["acquire", "test_status"])
            .get();
        record_lease_operation("acquire", "test_status");
        let after = LEASE_OPERATIONS
            .with_label_values(&["acquire", "test_status"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_record_batch_counts_events() {
        let before = EVENTS_PROCESSED.with_label_values(&["metrics-test"]).get();
        record_batch("metrics-test", 100);
        let after = EVENTS_PROCESSED.with_label_values(&["metrics-test"]).get();
        assert_eq!(after - before, 100);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_checkpoint("success", 0.002);
        record_worker_exit("cancelled");
        record_store_failure("list_leases");
        record_error("source");
        set_owned_partitions(3);
        set_fair_share(4);
    }

    #[test]
    fn test_encode_metrics_uses_prefix() {
        init_metrics();
        record_lease_operation("renew", "success");
        let text = encode_metrics().unwrap();
        assert!(text.contains("leasehold_lease_operations_total"));
    }
}
