//! Analytics sink for usage records
//!
//! The pipeline ensures the destination table once per flush and then writes
//! the whole cycle batch in a single call.

mod bigquery;

pub use bigquery::{usage_record_schema, BigQuerySink, TableField};

use crate::models::UsageRecord;
use anyhow::Result;
use async_trait::async_trait;

/// Fully qualified destination table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Return the destination table, creating it if missing
    async fn ensure_table(&self) -> Result<TableRef>;

    /// Append `records` to `table`
    async fn write_batch(&self, table: &TableRef, records: &[UsageRecord]) -> Result<()>;
}
