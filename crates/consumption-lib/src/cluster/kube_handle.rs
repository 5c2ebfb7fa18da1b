//! Cluster handle backed by `kube`
//!
//! The underlying client is rebuilt whenever the access token rotates, so a
//! handle stays usable for the life of the process.

use super::node::parse_quantity_ceil;
use super::{ClusterEndpoint, ClusterHandle, NodeInfo, PodInfo};
use crate::auth::TokenSource;
use crate::models::ClusterIdentity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub struct KubeClusterHandle {
    cluster: ClusterIdentity,
    base_config: Config,
    tokens: Arc<dyn TokenSource>,
    /// Client together with the token it was built with
    client: RwLock<Option<(String, Client)>>,
}

impl KubeClusterHandle {
    /// Build a handle and authenticate once so bad credentials surface here
    pub async fn connect(
        cluster: ClusterIdentity,
        endpoint: &ClusterEndpoint,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self> {
        let cluster_url = format!("https://{}", endpoint.endpoint)
            .parse()
            .with_context(|| format!("Invalid API server endpoint {:?}", endpoint.endpoint))?;

        let mut config = Config::new(cluster_url);
        config.root_cert = Some(der_certificates(&endpoint.ca_certificate)?);
        config.connect_timeout = Some(timeout);
        config.read_timeout = Some(timeout);

        let handle = Self {
            cluster,
            base_config: config,
            tokens,
            client: RwLock::new(None),
        };
        handle.client().await?;
        Ok(handle)
    }

    async fn client(&self) -> Result<Client> {
        let token = self.tokens.token().await?;
        {
            let current = self.client.read().await;
            if let Some((built_with, client)) = current.as_ref() {
                if *built_with == token {
                    return Ok(client.clone());
                }
            }
        }

        let mut config = self.base_config.clone();
        config.auth_info.token = Some(token.clone().into());
        let client = Client::try_from(config).context("Failed to create kube client")?;
        debug!(cluster = %self.cluster, "Built kube client");

        *self.client.write().await = Some((token, client.clone()));
        Ok(client)
    }
}

/// Decode a PEM bundle into DER certificates
fn der_certificates(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).context("Failed to parse cluster CA PEM")?;
    if certs.is_empty() {
        anyhow::bail!("cluster CA contains no certificates");
    }
    Ok(certs)
}

#[async_trait]
impl ClusterHandle for KubeClusterHandle {
    fn cluster(&self) -> &ClusterIdentity {
        &self.cluster
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo> {
        let pods: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let pod = pods
            .get(name)
            .await
            .with_context(|| format!("error getting pod {}/{}", namespace, name))?;

        Ok(PodInfo {
            labels: pod.metadata.labels.unwrap_or_default(),
            node_name: pod.spec.and_then(|s| s.node_name).unwrap_or_default(),
        })
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        let node = nodes
            .get(name)
            .await
            .with_context(|| format!("error getting node {}", name))?;

        let capacity = node
            .status
            .and_then(|s| s.capacity)
            .unwrap_or_default();
        let cpu = capacity
            .get("cpu")
            .map(|q| parse_quantity_ceil(&q.0))
            .transpose()
            .with_context(|| format!("error converting cpu capacity of node {}", name))?
            .unwrap_or_default();
        let memory = capacity
            .get("memory")
            .map(|q| parse_quantity_ceil(&q.0))
            .transpose()
            .with_context(|| format!("error converting memory capacity of node {}", name))?
            .unwrap_or_default();

        Ok(NodeInfo {
            name: name.to_string(),
            labels: node.metadata.labels.unwrap_or_default(),
            cpu_capacity: cpu,
            mem_capacity: memory,
        })
    }
}
