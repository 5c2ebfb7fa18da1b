//! Cluster handle cache
//!
//! Handles are created lazily on first use and kept until shutdown. There is
//! no eviction; the map is bounded by the number of distinct clusters seen in
//! telemetry. Concurrent first requests for the same cluster share a single
//! resolution, and failed resolutions are not cached.

use super::{ClusterHandle, ClusterResolver};
use crate::models::ClusterIdentity;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

type HandleCell = Arc<OnceCell<Arc<dyn ClusterHandle>>>;

pub struct ClusterClientCache {
    resolver: Arc<dyn ClusterResolver>,
    handles: DashMap<String, HandleCell>,
}

impl ClusterClientCache {
    pub fn new(resolver: Arc<dyn ClusterResolver>) -> Self {
        Self {
            resolver,
            handles: DashMap::new(),
        }
    }

    /// Return the cached handle for `cluster`, creating it on first use
    pub async fn get_or_create(&self, cluster: &ClusterIdentity) -> Result<Arc<dyn ClusterHandle>> {
        let key = cluster.cache_key();
        let cell = self
            .handles
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let handle = cell
            .get_or_try_init(|| async {
                info!(cluster = %key, "Cluster handle not found, creating");
                let endpoint = self.resolver.resolve(cluster).await?;
                self.resolver.connect(cluster, endpoint).await
            })
            .await?;

        Ok(handle.clone())
    }

    /// Number of clusters with a live handle
    pub fn len(&self) -> usize {
        self.handles.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ClusterEndpoint, NodeInfo, PodInfo};
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubHandle {
        cluster: ClusterIdentity,
    }

    #[async_trait]
    impl ClusterHandle for StubHandle {
        fn cluster(&self) -> &ClusterIdentity {
            &self.cluster
        }

        async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<PodInfo> {
            Ok(PodInfo::default())
        }

        async fn get_node(&self, _name: &str) -> Result<NodeInfo> {
            Ok(NodeInfo::default())
        }
    }

    /// Resolver that counts calls and fails the first `fail_first` times
    struct CountingResolver {
        resolves: AtomicUsize,
        fail_first: usize,
    }

    impl CountingResolver {
        fn new(fail_first: usize) -> Self {
            Self {
                resolves: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl ClusterResolver for CountingResolver {
        async fn resolve(&self, _cluster: &ClusterIdentity) -> Result<ClusterEndpoint> {
            let n = self.resolves.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if n < self.fail_first {
                anyhow::bail!("control plane unavailable");
            }
            Ok(ClusterEndpoint {
                endpoint: "10.0.0.1".to_string(),
                ca_certificate: Vec::new(),
            })
        }

        async fn connect(
            &self,
            cluster: &ClusterIdentity,
            _endpoint: ClusterEndpoint,
        ) -> Result<Arc<dyn ClusterHandle>> {
            Ok(Arc::new(StubHandle {
                cluster: cluster.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_same_identity_returns_same_handle() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = ClusterClientCache::new(resolver.clone());
        let cluster = ClusterIdentity::new("proj", "us-central1", "c1");

        let first = cache.get_or_create(&cluster).await.unwrap();
        let second = cache.get_or_create(&cluster).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_identities_get_distinct_handles() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = ClusterClientCache::new(resolver.clone());

        let a = cache
            .get_or_create(&ClusterIdentity::new("proj", "us-central1", "c1"))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&ClusterIdentity::new("proj", "us-central1", "c2"))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.cluster().name, "c2");
        assert_eq!(resolver.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let resolver = Arc::new(CountingResolver::new(1));
        let cache = ClusterClientCache::new(resolver.clone());
        let cluster = ClusterIdentity::new("proj", "us-central1", "c1");

        assert!(cache.get_or_create(&cluster).await.is_err());
        assert!(cache.is_empty());

        assert!(cache.get_or_create(&cluster).await.is_ok());
        assert_eq!(resolver.resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_resolve_once() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = Arc::new(ClusterClientCache::new(resolver.clone()));
        let cluster = ClusterIdentity::new("proj", "us-central1", "c1");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let cluster = cluster.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_or_create(&cluster).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(resolver.resolves.load(Ordering::SeqCst), 1);
    }
}
