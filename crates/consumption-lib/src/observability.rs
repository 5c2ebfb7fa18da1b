//! Observability infrastructure for the consumption exporter
//!
//! Provides:
//! - Prometheus metrics (cycle latency, exported records, skipped groups, cache hit ratio)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for export cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

struct ExporterMetricsInner {
    cycle_latency_seconds: Histogram,
    cycles_total: IntCounter,
    records_exported: IntCounter,
    groups_skipped: IntCounterVec,
    sink_failures: IntCounter,
    query_failures: IntCounter,
    node_cache_hits: IntCounter,
    node_cache_misses: IntCounter,
    cluster_handles: IntGauge,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "consumption_exporter_cycle_latency_seconds",
                "Time spent running one export cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            cycles_total: register_int_counter!(
                "consumption_exporter_cycles_total",
                "Total number of completed export cycles"
            )
            .expect("Failed to register cycles_total"),

            records_exported: register_int_counter!(
                "consumption_exporter_records_exported_total",
                "Total number of usage records written to the sink"
            )
            .expect("Failed to register records_exported"),

            groups_skipped: register_int_counter_vec!(
                "consumption_exporter_groups_skipped_total",
                "Telemetry groups skipped during attribution, by reason",
                &["reason"]
            )
            .expect("Failed to register groups_skipped"),

            sink_failures: register_int_counter!(
                "consumption_exporter_sink_failures_total",
                "Total number of failed batch writes"
            )
            .expect("Failed to register sink_failures"),

            query_failures: register_int_counter!(
                "consumption_exporter_query_failures_total",
                "Total number of failed telemetry queries"
            )
            .expect("Failed to register query_failures"),

            node_cache_hits: register_int_counter!(
                "consumption_exporter_node_cache_hits_total",
                "Node capacity lookups served from the cache"
            )
            .expect("Failed to register node_cache_hits"),

            node_cache_misses: register_int_counter!(
                "consumption_exporter_node_cache_misses_total",
                "Node capacity lookups that required a live fetch"
            )
            .expect("Failed to register node_cache_misses"),

            cluster_handles: register_int_gauge!(
                "consumption_exporter_cluster_handles",
                "Number of live cluster handles"
            )
            .expect("Failed to register cluster_handles"),
        }
    }
}

/// Exporter metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    _private: (),
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
        self.inner().cycles_total.inc();
    }

    pub fn add_records_exported(&self, count: usize) {
        self.inner().records_exported.inc_by(count as u64);
    }

    /// Increment skipped groups for `reason`
    pub fn inc_groups_skipped(&self, reason: &str) {
        self.inner()
            .groups_skipped
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_sink_failures(&self) {
        self.inner().sink_failures.inc();
    }

    pub fn inc_query_failures(&self) {
        self.inner().query_failures.inc();
    }

    pub fn inc_node_cache_hit(&self) {
        self.inner().node_cache_hits.inc();
    }

    pub fn inc_node_cache_miss(&self) {
        self.inner().node_cache_misses.inc();
    }

    pub fn set_cluster_handles(&self, count: usize) {
        self.inner().cluster_handles.set(count as i64);
    }
}

/// Structured logger for exporter events
///
/// Provides consistent JSON-formatted logging for cycle outcomes and
/// lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    project_id: String,
}

impl StructuredLogger {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, table: &str, interval_secs: u64) {
        info!(
            event = "exporter_started",
            project = %self.project_id,
            exporter_version = %version,
            table = %table,
            interval_secs = interval_secs,
            "Consumption exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            project = %self.project_id,
            reason = %reason,
            "Consumption exporter shutting down"
        );
    }

    /// Log a skipped telemetry group
    pub fn log_group_skipped(&self, resource: &str, reason: &str, details: &str) {
        warn!(
            event = "group_skipped",
            project = %self.project_id,
            resource = %resource,
            reason = %reason,
            details = %details,
            "Skipping telemetry group"
        );
    }

    /// Log a completed export cycle
    pub fn log_cycle_completed(&self, records: usize, skipped: usize, duration_secs: f64) {
        info!(
            event = "cycle_completed",
            project = %self.project_id,
            records = records,
            skipped = skipped,
            duration_secs = duration_secs,
            "Export cycle completed"
        );
    }

    /// Log the outcome of a batch flush
    pub fn log_flush(&self, table: &str, records: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "batch_flushed",
                project = %self.project_id,
                table = %table,
                records = records,
                "Flushed usage records"
            ),
            Some(error) => warn!(
                event = "batch_flush_failed",
                project = %self.project_id,
                table = %table,
                records = records,
                error = %error,
                "Failed to flush usage records, batch dropped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_metrics_creation() {
        let metrics = ExporterMetrics::new();

        metrics.observe_cycle_latency(1.5);
        metrics.add_records_exported(10);
        metrics.inc_groups_skipped("malformed_labels");
        metrics.inc_sink_failures();
        metrics.inc_node_cache_hit();
        metrics.inc_node_cache_miss();
        metrics.set_cluster_handles(2);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-project");
        assert_eq!(logger.project_id, "test-project");
    }
}
