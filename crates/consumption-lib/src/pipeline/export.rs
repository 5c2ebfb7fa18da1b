//! Export cycle
//!
//! One pass over every resource kind: query telemetry, resolve each group to
//! a usage record, then flush the whole batch to the sink once. A failing
//! group is logged and skipped; it never aborts the cycle.

use crate::calculator;
use crate::cluster::{record_from_node, ClusterClientCache, ClusterHandle};
use crate::error::AttributionError;
use crate::health::{CycleReport, HealthRegistry};
use crate::models::{
    to_label_list, GroupLabels, NodeCapacityRecord, NodeIdentity, Project, Usage, UsageRecord,
    CONTAINER_NAME_LABEL, POD_NAME_LABEL,
};
use crate::observability::{ExporterMetrics, StructuredLogger};
use crate::resource::{QueryWindow, ResourceKind, RESOURCE_KINDS};
use crate::sink::AnalyticsSink;
use crate::store::NodeCapacityStore;
use crate::telemetry::{TelemetrySource, TimeSeriesGroup};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for an export cycle
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Telemetry window queried for every resource kind
    pub window: QueryWindow,
    /// Groups resolved concurrently within one resource kind (default: 8)
    pub group_concurrency: usize,
    /// Upper bound on resolving a single group (default: 10 seconds)
    pub request_timeout: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            window: QueryWindow::default(),
            group_concurrency: 8,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a completed cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    pub records: Vec<UsageRecord>,
    /// Groups skipped because of a per-group error
    pub skipped: usize,
    /// Skipped groups per error kind
    pub skip_reasons: BTreeMap<&'static str, usize>,
    /// Kinds whose telemetry query failed
    pub failed_queries: usize,
    /// Groups skipped because their node capacity could not be cached
    pub cache_write_failures: usize,
    /// Whether the sink accepted the batch
    pub flushed: bool,
    pub sink_error: Option<String>,
}

impl CycleOutcome {
    fn report(&self, duration_secs: f64) -> CycleReport {
        CycleReport {
            completed_at: Utc::now(),
            duration_secs,
            records: self.records.len(),
            skipped: self.skipped,
            failed_queries: self.failed_queries,
            cache_write_failures: self.cache_write_failures,
            sink_error: self.sink_error.clone(),
        }
    }
}

/// Records and skip count for one resource kind
#[derive(Debug, Default)]
struct KindResult {
    records: Vec<UsageRecord>,
    skipped: usize,
    skip_reasons: BTreeMap<&'static str, usize>,
    cache_write_failures: usize,
    query_failed: bool,
}

pub struct ExportCycle {
    project_id: String,
    telemetry: Arc<dyn TelemetrySource>,
    clusters: Arc<ClusterClientCache>,
    nodes: Arc<NodeCapacityStore>,
    sink: Arc<dyn AnalyticsSink>,
    config: ExportConfig,
    health: HealthRegistry,
    metrics: ExporterMetrics,
    logger: StructuredLogger,
}

impl ExportCycle {
    /// Run one cycle and flush its batch.
    ///
    /// Returns `None` when `cancel` fires first; the partial batch is
    /// discarded without a flush.
    pub async fn run(&self, cancel: &CancellationToken) -> Option<CycleOutcome> {
        let start = Instant::now();

        let mut outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Export cycle cancelled, discarding partial batch");
                return None;
            }
            outcome = self.collect() => outcome,
        };

        let flushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Export cycle cancelled during flush");
                return None;
            }
            flushed = self.flush(&outcome.records) => flushed,
        };
        outcome.flushed = flushed.is_ok();
        outcome.sink_error = flushed.err().map(|e| format!("{:#}", e));

        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_cycle_latency(elapsed);
        self.logger
            .log_cycle_completed(outcome.records.len(), outcome.skipped, elapsed);
        self.health.record_cycle(outcome.report(elapsed)).await;

        Some(outcome)
    }

    /// Resolve every resource kind into usage records without flushing
    pub async fn collect(&self) -> CycleOutcome {
        let now = Utc::now();
        let mut outcome = CycleOutcome::default();

        for kind in RESOURCE_KINDS.iter() {
            info!(resource = kind.name, "Exporting usage");
            let result = self.collect_kind(kind, now).await;

            outcome.records.extend(result.records);
            outcome.skipped += result.skipped;
            for (reason, count) in result.skip_reasons {
                *outcome.skip_reasons.entry(reason).or_default() += count;
            }
            outcome.cache_write_failures += result.cache_write_failures;
            if result.query_failed {
                outcome.failed_queries += 1;
            }
        }

        self.metrics.set_cluster_handles(self.clusters.len());
        outcome
    }

    /// Write `records` to the sink in a single call
    pub async fn flush(&self, records: &[UsageRecord]) -> Result<()> {
        info!(records = records.len(), "Exporting usage records");

        match self.write(records).await {
            Ok(table) => {
                self.metrics.add_records_exported(records.len());
                self.logger.log_flush(&table, records.len(), None);
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_sink_failures();
                self.logger
                    .log_flush("-", records.len(), Some(&format!("{:#}", e)));
                Err(e)
            }
        }
    }

    async fn write(&self, records: &[UsageRecord]) -> Result<String> {
        let table = self.sink.ensure_table().await?;
        self.sink.write_batch(&table, records).await?;
        Ok(table.to_string())
    }

    async fn collect_kind(&self, kind: &ResourceKind, now: DateTime<Utc>) -> KindResult {
        let query = (kind.query)(&self.config.window);

        let groups = match self.telemetry.query(&query, &self.project_id).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(resource = kind.name, error = %e, "Error found querying time series");
                self.metrics.inc_query_failures();
                return KindResult {
                    query_failed: true,
                    ..Default::default()
                };
            }
        };
        debug!(resource = kind.name, groups = groups.len(), "Found time series groups");

        let results: Vec<Result<UsageRecord, AttributionError>> = stream::iter(groups)
            .map(|group| self.attribute_group(kind, group, now))
            .buffered(self.config.group_concurrency.max(1))
            .collect()
            .await;

        let mut out = KindResult::default();
        let mut total_fraction = 0.0;
        for result in results {
            match result {
                Ok(record) => {
                    total_fraction += record.fraction;
                    out.records.push(record);
                }
                Err(e) => {
                    if matches!(e, AttributionError::CacheWrite { .. }) {
                        out.cache_write_failures += 1;
                    }
                    *out.skip_reasons.entry(e.kind()).or_default() += 1;
                    self.metrics.inc_groups_skipped(e.kind());
                    self.logger
                        .log_group_skipped(kind.name, e.kind(), &e.to_string());
                    out.skipped += 1;
                }
            }
        }

        debug!(resource = kind.name, total_fraction, "Resolved resource kind");
        out
    }

    async fn attribute_group(
        &self,
        kind: &ResourceKind,
        group: TimeSeriesGroup,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, AttributionError> {
        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, self.resolve_group(kind, group, now))
            .await
            .map_err(|_| AttributionError::Timeout(timeout))?
    }

    async fn resolve_group(
        &self,
        kind: &ResourceKind,
        group: TimeSeriesGroup,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, AttributionError> {
        let labels = GroupLabels::decode(&group.label_values)?;
        let window = group
            .window()
            .normalize(self.config.window.resolution_chrono());
        let summary = calculator::aggregate(&window)?;

        let cluster = labels.cluster();
        let handle = self
            .clusters
            .get_or_create(&cluster)
            .await
            .map_err(|source| AttributionError::ClusterResolution {
                cluster: cluster.to_string(),
                source,
            })?;

        let pod = handle
            .get_pod(&labels.namespace, &labels.pod_name)
            .await
            .map_err(|source| AttributionError::PodNotFound {
                namespace: labels.namespace.clone(),
                name: labels.pod_name.clone(),
                source,
            })?;
        if pod.node_name.is_empty() {
            return Err(AttributionError::PodUnscheduled {
                namespace: labels.namespace,
                name: labels.pod_name,
            });
        }

        let node = self.node_capacity(handle.as_ref(), &pod.node_name, now).await?;
        let capacity = (kind.capacity)(&node);
        let fraction = calculator::attribute(&summary, capacity, &node.node_name, kind.name)?;

        let mut pod_labels = pod.labels;
        pod_labels.insert(POD_NAME_LABEL.to_string(), labels.pod_name);
        pod_labels.insert(CONTAINER_NAME_LABEL.to_string(), labels.container);

        Ok(UsageRecord {
            resource_id: 0,
            region: node.region,
            cluster_location: labels.location,
            cluster_name: labels.cluster_name,
            namespace: labels.namespace,
            resource_name: kind.name.to_string(),
            sku_id: String::new(),
            start_time: summary.start_time,
            end_time: summary.end_time,
            fraction,
            cloud_resource_size: capacity,
            labels: to_label_list(&pod_labels),
            project: Project {
                id: labels.project_id,
            },
            usage: Usage {
                amount: summary.integrated_value,
                unit: kind.unit,
            },
        })
    }

    /// Fresh cached capacity for `node_name`, refreshed from the cluster on a miss
    async fn node_capacity(
        &self,
        handle: &dyn ClusterHandle,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeCapacityRecord, AttributionError> {
        let identity = NodeIdentity::new(handle.cluster(), node_name);
        if let Some(record) = self.nodes.get_fresh(&identity, now) {
            self.metrics.inc_node_cache_hit();
            return Ok(record);
        }
        self.metrics.inc_node_cache_miss();

        let info = handle
            .get_node(node_name)
            .await
            .map_err(|source| AttributionError::NodeNotFound {
                name: node_name.to_string(),
                source,
            })?;
        let record = record_from_node(&info, handle.cluster(), now).map_err(|source| {
            AttributionError::NodeMetadata {
                name: node_name.to_string(),
                source,
            }
        })?;

        self.nodes
            .upsert(record.clone())
            .await
            .map_err(|source| AttributionError::CacheWrite {
                key: identity.cache_key(),
                source,
            })?;

        Ok(record)
    }
}

/// Builder for an [`ExportCycle`]
pub struct ExportCycleBuilder {
    project_id: Option<String>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    clusters: Option<Arc<ClusterClientCache>>,
    nodes: Option<Arc<NodeCapacityStore>>,
    sink: Option<Arc<dyn AnalyticsSink>>,
    config: ExportConfig,
    health: HealthRegistry,
}

impl ExportCycleBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            project_id: None,
            telemetry: None,
            clusters: None,
            nodes: None,
            sink: None,
            config: ExportConfig::default(),
            health: HealthRegistry::new(),
        }
    }

    /// Project whose telemetry is queried
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn clusters(mut self, clusters: Arc<ClusterClientCache>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    pub fn nodes(mut self, nodes: Arc<NodeCapacityStore>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a health registry with the API server
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Build the export cycle
    pub fn build(self) -> Result<ExportCycle> {
        let project_id = self
            .project_id
            .ok_or_else(|| anyhow::anyhow!("Project ID is required"))?;
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow::anyhow!("Telemetry source is required"))?;
        let clusters = self
            .clusters
            .ok_or_else(|| anyhow::anyhow!("Cluster client cache is required"))?;
        let nodes = self
            .nodes
            .ok_or_else(|| anyhow::anyhow!("Node capacity store is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Analytics sink is required"))?;

        Ok(ExportCycle {
            logger: StructuredLogger::new(project_id.clone()),
            project_id,
            telemetry,
            clusters,
            nodes,
            sink,
            config: self.config,
            health: self.health,
            metrics: ExporterMetrics::new(),
        })
    }
}

impl Default for ExportCycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
