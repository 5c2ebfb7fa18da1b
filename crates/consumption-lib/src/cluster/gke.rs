//! GKE cluster resolver
//!
//! Reads the control plane endpoint and CA of a cluster from the Kubernetes
//! Engine API and connects a [`KubeClusterHandle`] to it.

use super::{ClusterEndpoint, ClusterHandle, ClusterResolver, KubeClusterHandle};
use crate::auth::TokenSource;
use crate::models::ClusterIdentity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const CONTAINER_ENDPOINT: &str = "https://container.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    endpoint: String,
    #[serde(default)]
    master_auth: MasterAuth,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterAuth {
    #[serde(default)]
    cluster_ca_certificate: String,
}

pub struct GkeClusterResolver {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    endpoint: String,
    timeout: Duration,
}

impl GkeClusterResolver {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>, timeout: Duration) -> Self {
        Self::with_endpoint(http, tokens, timeout, CONTAINER_ENDPOINT)
    }

    /// Use a custom API endpoint (for testing)
    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ClusterResolver for GkeClusterResolver {
    async fn resolve(&self, cluster: &ClusterIdentity) -> Result<ClusterEndpoint> {
        let url = format!("{}/v1/{}", self.endpoint, cluster);
        let token = self.tokens.token().await?;

        let gke: GkeCluster = self
            .http
            .get(&url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("Failed to get cluster {}", cluster))?
            .error_for_status()
            .with_context(|| format!("Cluster lookup rejected for {}", cluster))?
            .json()
            .await
            .context("Failed to decode cluster response")?;

        let ca_certificate = base64::engine::general_purpose::STANDARD
            .decode(gke.master_auth.cluster_ca_certificate.trim())
            .with_context(|| format!("Unable to decode CA cert for cluster {}", cluster))?;

        Ok(ClusterEndpoint {
            endpoint: gke.endpoint,
            ca_certificate,
        })
    }

    async fn connect(
        &self,
        cluster: &ClusterIdentity,
        endpoint: ClusterEndpoint,
    ) -> Result<Arc<dyn ClusterHandle>> {
        let handle =
            KubeClusterHandle::connect(cluster.clone(), &endpoint, self.tokens.clone(), self.timeout)
                .await?;
        Ok(Arc::new(handle))
    }
}
