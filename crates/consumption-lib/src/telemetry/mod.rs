//! Telemetry source
//!
//! Returns label-grouped time series for a fixed query. Each group carries
//! positional label values and its aligned point data.

mod monitoring;

pub use monitoring::MonitoringClient;

use crate::models::{Sample, SampleWindow};
use anyhow::Result;
use async_trait::async_trait;

/// One label-grouped time series
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesGroup {
    pub label_values: Vec<String>,
    pub samples: Vec<Sample>,
}

impl TimeSeriesGroup {
    pub fn new(label_values: Vec<String>, samples: Vec<Sample>) -> Self {
        Self {
            label_values,
            samples,
        }
    }

    pub fn window(&self) -> SampleWindow {
        SampleWindow::new(self.samples.clone())
    }
}

/// Time series backend
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Run `query` scoped to `project_id`
    async fn query(&self, query: &str, project_id: &str) -> Result<Vec<TimeSeriesGroup>>;
}
