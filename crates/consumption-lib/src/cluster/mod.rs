//! Access to the orchestration control plane
//!
//! A [`ClusterResolver`] turns a cluster identity into a live
//! [`ClusterHandle`]; the [`ClusterClientCache`] keeps one handle per
//! cluster for the life of the process.

mod cache;
mod gke;
mod kube_handle;
mod node;

pub use cache::ClusterClientCache;
pub use gke::GkeClusterResolver;
pub use kube_handle::KubeClusterHandle;
pub use node::{parse_quantity, record_from_node};

use crate::models::ClusterIdentity;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Control plane endpoint of a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    /// Host (and optional port) of the API server
    pub endpoint: String,
    /// PEM encoded cluster CA
    pub ca_certificate: Vec<u8>,
}

/// Pod fields the pipeline needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub labels: BTreeMap<String, String>,
    /// Empty while the pod is unscheduled
    pub node_name: String,
}

/// Node fields the pipeline needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Whole cores, rounded up
    pub cpu_capacity: i64,
    /// Bytes
    pub mem_capacity: i64,
}

/// Authenticated capability bound to one cluster
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    fn cluster(&self) -> &ClusterIdentity;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo>;

    async fn get_node(&self, name: &str) -> Result<NodeInfo>;
}

/// Resolves and connects to clusters
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// Look up the control plane endpoint and CA of a cluster
    async fn resolve(&self, cluster: &ClusterIdentity) -> Result<ClusterEndpoint>;

    /// Build an authenticated handle for a resolved cluster
    async fn connect(
        &self,
        cluster: &ClusterIdentity,
        endpoint: ClusterEndpoint,
    ) -> Result<Arc<dyn ClusterHandle>>;
}
