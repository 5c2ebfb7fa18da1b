//! Errors raised while attributing a single telemetry group
//!
//! Every variant is recoverable at cycle level: the group is logged and
//! skipped, the rest of the cycle continues.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("expected {expected} label values, found {found}: {values:?}")]
    MalformedLabels {
        expected: usize,
        found: usize,
        values: Vec<String>,
    },

    #[error("cannot aggregate an empty sample window")]
    EmptyWindow,

    #[error("node {node} reports zero {resource} capacity")]
    ZeroCapacity { node: String, resource: String },

    #[error("resolving cluster {cluster}: {source}")]
    ClusterResolution {
        cluster: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetching pod {namespace}/{name}: {source}")]
    PodNotFound {
        namespace: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pod {namespace}/{name} is not scheduled on a node")]
    PodUnscheduled { namespace: String, name: String },

    #[error("fetching node {name}: {source}")]
    NodeNotFound {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("reading metadata of node {name}: {source}")]
    NodeMetadata {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("writing node capacity cache for {key}: {source}")]
    CacheWrite {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("group resolution exceeded {0:?}")]
    Timeout(Duration),
}

impl AttributionError {
    /// Short label for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            AttributionError::MalformedLabels { .. } => "malformed_labels",
            AttributionError::EmptyWindow => "empty_window",
            AttributionError::ZeroCapacity { .. } => "zero_capacity",
            AttributionError::ClusterResolution { .. } => "cluster_resolution",
            AttributionError::PodNotFound { .. } => "pod_not_found",
            AttributionError::PodUnscheduled { .. } => "pod_unscheduled",
            AttributionError::NodeNotFound { .. } => "node_not_found",
            AttributionError::NodeMetadata { .. } => "node_metadata",
            AttributionError::CacheWrite { .. } => "cache_write",
            AttributionError::Timeout(_) => "timeout",
        }
    }
}
