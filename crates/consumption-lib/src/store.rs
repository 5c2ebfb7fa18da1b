//! Persistent node capacity cache
//!
//! Node capacity and metadata keyed by project, cluster, location and node
//! name. Records live in memory and are persisted to a JSON file so they
//! survive restarts:
//! - Reads never block and always observe whole records
//! - Upserts are serialized by a single write lock
//! - Records older than the freshness window are treated as misses

use crate::models::{NodeCapacityRecord, NodeIdentity};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default freshness window (5 minutes)
pub const DEFAULT_NODE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Keyed store of node capacity records
pub struct NodeCapacityStore {
    records: DashMap<String, NodeCapacityRecord>,
    /// Where records are persisted; `None` keeps the store in memory only
    path: Option<PathBuf>,
    ttl: chrono::Duration,
    write_lock: Mutex<()>,
}

impl NodeCapacityStore {
    /// Create a store that is never persisted
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            path: None,
            ttl: to_chrono(ttl),
            write_lock: Mutex::new(()),
        }
    }

    /// Open a persisted store, loading existing records from `path`
    pub fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let path = path.into();
        let store = Self {
            records: DashMap::new(),
            path: Some(path.clone()),
            ttl: to_chrono(ttl),
            write_lock: Mutex::new(()),
        };

        if path.exists() {
            match load_records(&path) {
                Ok(records) => {
                    for record in records {
                        store.records.insert(record.identity().cache_key(), record);
                    }
                    info!(path = %path.display(), entries = store.records.len(), "Loaded node capacity cache");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load node capacity cache, starting empty");
                }
            }
        }

        Ok(store)
    }

    /// Get a record regardless of its age
    pub fn get(&self, identity: &NodeIdentity) -> Option<NodeCapacityRecord> {
        self.records
            .get(&identity.cache_key())
            .map(|r| r.value().clone())
    }

    /// Get a record only if it was refreshed within the freshness window
    pub fn get_fresh(
        &self,
        identity: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Option<NodeCapacityRecord> {
        let record = self.get(identity)?;
        if record.is_fresh(now, self.ttl) {
            Some(record)
        } else {
            debug!(key = %identity.cache_key(), last_updated = %record.last_updated, "Node capacity record is stale");
            None
        }
    }

    /// Insert or replace a record and persist the store
    pub async fn upsert(&self, record: NodeCapacityRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let key = record.identity().cache_key();
        let previous = self.records.insert(key.clone(), record);

        if let Some(ref path) = self.path {
            if let Err(e) = self.persist(path) {
                // Keep memory and disk consistent for the failed write
                match previous {
                    Some(old) => {
                        self.records.insert(key, old);
                    }
                    None => {
                        self.records.remove(&key);
                    }
                }
                return Err(e);
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Write all records to disk atomically via a temp file
    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let mut records: Vec<NodeCapacityRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.identity().cache_key());
        let json = serde_json::to_vec(&records).context("Failed to serialize node records")?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &json)
            .with_context(|| format!("Failed to write temp file {:?}", temp_path))?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        debug!(path = %path.display(), entries = records.len(), "Node capacity cache persisted");
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<Vec<NodeCapacityRecord>> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read cache file {:?}", path))?;
    serde_json::from_slice(&data).context("Failed to deserialize node records")
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
}
