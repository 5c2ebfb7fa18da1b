//! Core data models for the consumption exporter
//!
//! Record shapes follow the GKE usage metering export so the resulting table
//! can be joined with the billing export.

use crate::error::AttributionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Number of positional label values every telemetry group carries.
pub const GROUP_LABEL_COUNT: usize = 6;

/// Label key synthesized from the telemetry group's pod name
pub const POD_NAME_LABEL: &str = "pod-name";
/// Label key synthesized from the telemetry group's container name
pub const CONTAINER_NAME_LABEL: &str = "container-name";

/// Identity of a managed cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterIdentity {
    pub project_id: String,
    pub location: String,
    pub name: String,
}

impl ClusterIdentity {
    pub fn new(
        project_id: impl Into<String>,
        location: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location: location.into(),
            name: name.into(),
        }
    }

    /// Key used by the cluster client cache; `/` never appears in GCP names
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.project_id, self.location, self.name)
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/clusters/{}",
            self.project_id, self.location, self.name
        )
    }
}

/// Identity of a node inside a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub project_id: String,
    pub cluster_name: String,
    pub cluster_location: String,
    pub node_name: String,
}

impl NodeIdentity {
    pub fn new(cluster: &ClusterIdentity, node_name: impl Into<String>) -> Self {
        Self {
            project_id: cluster.project_id.clone(),
            cluster_name: cluster.name.clone(),
            cluster_location: cluster.location.clone(),
            node_name: node_name.into(),
        }
    }

    /// Composite key used by the node capacity store
    pub fn cache_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.project_id, self.cluster_name, self.cluster_location, self.node_name
        )
    }
}

/// Cached capacity and metadata of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacityRecord {
    pub project_id: String,
    pub cluster_name: String,
    pub cluster_location: String,
    pub node_name: String,
    pub machine_type: String,
    pub preemptible: bool,
    pub region: String,
    /// Whole CPU cores
    pub cpu_capacity: i64,
    /// Bytes
    pub mem_capacity: i64,
    pub last_updated: DateTime<Utc>,
}

impl NodeCapacityRecord {
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            project_id: self.project_id.clone(),
            cluster_name: self.cluster_name.clone(),
            cluster_location: self.cluster_location.clone(),
            node_name: self.node_name.clone(),
        }
    }

    /// Whether the record was refreshed within `ttl` of `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_updated) <= ttl
    }
}

/// Typed view of the six positional label values of a telemetry group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLabels {
    pub project_id: String,
    pub location: String,
    pub cluster_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub container: String,
}

impl GroupLabels {
    /// Decode label values in query `group_by` order
    pub fn decode(values: &[String]) -> Result<Self, AttributionError> {
        match values {
            [project_id, location, cluster_name, namespace, pod_name, container] => Ok(Self {
                project_id: project_id.clone(),
                location: location.clone(),
                cluster_name: cluster_name.clone(),
                namespace: namespace.clone(),
                pod_name: pod_name.clone(),
                container: container.clone(),
            }),
            _ => Err(AttributionError::MalformedLabels {
                expected: GROUP_LABEL_COUNT,
                found: values.len(),
                values: values.to_vec(),
            }),
        }
    }

    pub fn cluster(&self) -> ClusterIdentity {
        ClusterIdentity::new(&self.project_id, &self.location, &self.cluster_name)
    }
}

/// A single aligned telemetry point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: f64) -> Self {
        Self { start, end, value }
    }

    /// Interval length in seconds
    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

/// Ordered run of samples for one label group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleWindow {
    samples: Vec<Sample>,
}

impl SampleWindow {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Sort by start time and widen zero-width intervals by `resolution`.
    ///
    /// Alignment produces a zero-width point at the head of a series; it
    /// stands for a full alignment period.
    pub fn normalize(mut self, resolution: chrono::Duration) -> Self {
        self.samples.sort_by_key(|s| s.start);
        for sample in &mut self.samples {
            if sample.start == sample.end {
                sample.end = sample.end + resolution;
            }
        }
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Derived usage over a sample window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Σ value × interval seconds
    pub integrated_value: f64,
    /// Σ value / sample count
    pub mean_value: f64,
}

/// Key/value pair of a Kubernetes label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Convert a label map into a key-ordered list
pub fn to_label_list(labels: &BTreeMap<String, String>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// GCP project that owns a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
}

/// Base unit in which resource usage is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageUnit {
    #[serde(rename = "bytes")]
    Bytes,
    #[serde(rename = "byte-seconds")]
    ByteSeconds,
    #[serde(rename = "seconds")]
    Seconds,
}

impl UsageUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageUnit::Bytes => "bytes",
            UsageUnit::ByteSeconds => "byte-seconds",
            UsageUnit::Seconds => "seconds",
        }
    }
}

impl fmt::Display for UsageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute amount of a consumed resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub amount: f64,
    pub unit: UsageUnit,
}

/// Billable usage of one container for one resource over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Not exported to the sink
    #[serde(skip)]
    pub resource_id: u64,
    /// Not exported to the sink
    #[serde(skip)]
    pub region: String,

    pub cluster_location: String,
    pub cluster_name: String,
    pub namespace: String,
    /// Key of the Kubernetes resource list (`cpu`, `memory`)
    pub resource_name: String,
    pub sku_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Share of the node's capacity consumed by the container
    pub fraction: f64,
    /// Node capacity the fraction is relative to
    pub cloud_resource_size: i64,
    pub labels: Vec<Label>,
    pub project: Project,
    pub usage: Usage,
}

impl fmt::Display for UsageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{{cluster_location={:?}, cluster_name={:?}, namespace={:?}, resource_name={:?}, \
             start_time={}, end_time={}, fraction={:.6}, cloud_resource_size={}, labels=[{}], \
             project={:?}, usage={} {}}}",
            self.cluster_location,
            self.cluster_name,
            self.namespace,
            self.resource_name,
            self.start_time,
            self.end_time,
            self.fraction,
            self.cloud_resource_size,
            labels.join(", "),
            self.project.id,
            self.usage.amount,
            self.usage.unit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("v{}", i)).collect()
    }

    #[test]
    fn test_decode_group_labels() {
        let decoded = GroupLabels::decode(&labels(6)).unwrap();
        assert_eq!(decoded.project_id, "v0");
        assert_eq!(decoded.location, "v1");
        assert_eq!(decoded.cluster_name, "v2");
        assert_eq!(decoded.namespace, "v3");
        assert_eq!(decoded.pod_name, "v4");
        assert_eq!(decoded.container, "v5");
    }

    #[test]
    fn test_decode_group_labels_wrong_count() {
        for n in [0, 5, 7] {
            let err = GroupLabels::decode(&labels(n)).unwrap_err();
            match err {
                AttributionError::MalformedLabels { expected, found, .. } => {
                    assert_eq!(expected, 6);
                    assert_eq!(found, n);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_cache_keys() {
        let cluster = ClusterIdentity::new("proj", "us-central1", "c1");
        assert_eq!(cluster.cache_key(), "proj/us-central1/c1");

        let node = NodeIdentity::new(&cluster, "node-a");
        assert_eq!(node.cache_key(), "proj/c1/us-central1/node-a");
    }

    #[test]
    fn test_dashed_names_do_not_collide() {
        let a = ClusterIdentity::new("proj", "us", "central1-a");
        let b = ClusterIdentity::new("proj", "us-central1", "a");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(
            NodeIdentity::new(&a, "n").cache_key(),
            NodeIdentity::new(&b, "n").cache_key()
        );
    }

    #[test]
    fn test_normalize_sorts_and_widens() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let minute = chrono::Duration::seconds(60);
        let window = SampleWindow::new(vec![
            Sample::new(t0 + minute, t0 + minute * 2, 2.0),
            Sample::new(t0, t0, 1.0),
        ])
        .normalize(minute);

        let samples = window.samples();
        assert_eq!(samples[0].start, t0);
        assert_eq!(samples[0].end, t0 + minute);
        assert_eq!(samples[1].start, t0 + minute);
    }

    #[test]
    fn test_usage_record_skips_internal_fields() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = UsageRecord {
            resource_id: 42,
            region: "us-central1".to_string(),
            cluster_location: "us-central1-a".to_string(),
            cluster_name: "c1".to_string(),
            namespace: "default".to_string(),
            resource_name: "cpu".to_string(),
            sku_id: String::new(),
            start_time: t0,
            end_time: t0,
            fraction: 0.1,
            cloud_resource_size: 4,
            labels: vec![],
            project: Project { id: "proj".to_string() },
            usage: Usage {
                amount: 1.0,
                unit: UsageUnit::Seconds,
            },
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("resource_id").is_none());
        assert!(json.get("region").is_none());
        assert_eq!(json["usage"]["unit"], "seconds");
        assert_eq!(json["project"]["id"], "proj");
    }

    #[test]
    fn test_record_freshness() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = NodeCapacityRecord {
            project_id: "p".into(),
            cluster_name: "c".into(),
            cluster_location: "l".into(),
            node_name: "n".into(),
            machine_type: "e2-standard-4".into(),
            preemptible: false,
            region: "us-central1".into(),
            cpu_capacity: 4,
            mem_capacity: 16 << 30,
            last_updated: t0,
        };
        let ttl = chrono::Duration::minutes(5);
        assert!(record.is_fresh(t0 + chrono::Duration::minutes(5), ttl));
        assert!(!record.is_fresh(t0 + chrono::Duration::minutes(6), ttl));
    }
}
