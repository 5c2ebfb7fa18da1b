//! Exporter configuration
//!
//! Read from an optional YAML file, then overridden by `EXPORTER_*`
//! environment variables (nested keys use `__`, e.g.
//! `EXPORTER_BIGQUERY__DATASET_NAME`).

use anyhow::{bail, Context, Result};
use consumption_lib::pipeline::ExportConfig;
use consumption_lib::resource::QueryWindow;
use consumption_lib::sink::TableRef;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the config file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "EXPORTER_CONFIG";

/// Destination table settings
#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    /// Project that owns the dataset; defaults to `project_id`
    #[serde(default)]
    pub billing_project: Option<String>,

    pub dataset_name: String,

    #[serde(default = "default_table_name")]
    pub consumption_table_name: String,
}

/// Exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Project whose telemetry is exported
    pub project_id: String,

    pub bigquery: BigQueryConfig,

    /// Seconds between export cycles
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Alignment resolution of the telemetry queries
    #[serde(default = "default_resolution")]
    pub resolution_secs: u64,

    /// Start of the query window, seconds before now
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,

    /// Length of the query window
    #[serde(default = "default_period")]
    pub period_secs: u64,

    /// Freshness window of cached node capacity
    #[serde(default = "default_node_cache_ttl")]
    pub node_cache_ttl_secs: u64,

    #[serde(default = "default_node_cache_path")]
    pub node_cache_path: PathBuf,

    /// Upper bound on remote calls and on resolving one telemetry group
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Telemetry groups resolved concurrently
    #[serde(default = "default_group_concurrency")]
    pub group_concurrency: usize,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_table_name() -> String {
    "consumption".to_string()
}

fn default_export_interval() -> u64 {
    3600
}

fn default_resolution() -> u64 {
    60
}

fn default_lookback() -> u64 {
    75 * 60
}

fn default_period() -> u64 {
    3600
}

fn default_node_cache_ttl() -> u64 {
    300
}

fn default_node_cache_path() -> PathBuf {
    PathBuf::from("cache/nodes.json")
}

fn default_request_timeout() -> u64 {
    10
}

fn default_group_concurrency() -> usize {
    8
}

fn default_api_port() -> u16 {
    8080
}

impl ExporterConfig {
    /// Load configuration from the config file and the process environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_sources(Path::new(&path), None)
    }

    /// Load from `path` (optional) and `env`, or the process environment
    /// when `env` is `None`
    pub fn from_sources(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("EXPORTER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: ExporterConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            bail!("project_id must be set");
        }
        if self.bigquery.dataset_name.trim().is_empty() {
            bail!("bigquery.dataset_name must be set");
        }
        if self.export_interval_secs == 0 {
            bail!("export_interval_secs must be greater than zero");
        }
        for (name, value) in [
            ("resolution_secs", self.resolution_secs),
            ("lookback_secs", self.lookback_secs),
            ("period_secs", self.period_secs),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.group_concurrency == 0 {
            bail!("group_concurrency must be greater than zero");
        }
        Ok(())
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn node_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.node_cache_ttl_secs)
    }

    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            window: QueryWindow {
                resolution: Duration::from_secs(self.resolution_secs),
                lookback: Duration::from_secs(self.lookback_secs),
                period: Duration::from_secs(self.period_secs),
            },
            group_concurrency: self.group_concurrency,
            request_timeout: self.request_timeout(),
        }
    }

    pub fn table(&self) -> TableRef {
        TableRef {
            project_id: self
                .bigquery
                .billing_project
                .clone()
                .unwrap_or_else(|| self.project_id.clone()),
            dataset_id: self.bigquery.dataset_name.clone(),
            table_id: self.bigquery.consumption_table_name.clone(),
        }
    }
}
