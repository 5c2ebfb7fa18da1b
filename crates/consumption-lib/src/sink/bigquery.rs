//! BigQuery sink
//!
//! Uses the REST API: `tables.get` to look up the table, `tables.insert` with
//! a day-partitioned schema when it is missing, and `tabledata.insertAll` to
//! stream rows.

use super::{AnalyticsSink, TableRef};
use crate::auth::TokenSource;
use crate::models::UsageRecord;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com";

/// Default timeout for table metadata requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Column of a BigQuery table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<TableField>,
}

impl TableField {
    fn nullable(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            mode: "NULLABLE".to_string(),
            fields: Vec::new(),
        }
    }

    fn record(name: &str, mode: &str, fields: Vec<TableField>) -> Self {
        Self {
            name: name.to_string(),
            field_type: "RECORD".to_string(),
            mode: mode.to_string(),
            fields,
        }
    }
}

/// Schema of the exported [`UsageRecord`].
///
/// Every column is optional; `resource_id` and `region` are not exported.
pub fn usage_record_schema() -> Vec<TableField> {
    vec![
        TableField::nullable("cluster_location", "STRING"),
        TableField::nullable("cluster_name", "STRING"),
        TableField::nullable("namespace", "STRING"),
        TableField::nullable("resource_name", "STRING"),
        TableField::nullable("sku_id", "STRING"),
        TableField::nullable("start_time", "TIMESTAMP"),
        TableField::nullable("end_time", "TIMESTAMP"),
        TableField::nullable("fraction", "FLOAT"),
        TableField::nullable("cloud_resource_size", "INTEGER"),
        TableField::record(
            "labels",
            "REPEATED",
            vec![
                TableField::nullable("key", "STRING"),
                TableField::nullable("value", "STRING"),
            ],
        ),
        TableField::record("project", "NULLABLE", vec![TableField::nullable("id", "STRING")]),
        TableField::record(
            "usage",
            "NULLABLE",
            vec![
                TableField::nullable("amount", "FLOAT"),
                TableField::nullable("unit", "STRING"),
            ],
        ),
    ]
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<serde_json::Value>,
}

/// Streams usage records into a BigQuery table
pub struct BigQuerySink {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    endpoint: String,
    table: TableRef,
    timeout: Duration,
}

impl BigQuerySink {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>, table: TableRef) -> Self {
        Self::with_endpoint(http, tokens, table, BIGQUERY_ENDPOINT)
    }

    /// Use a custom API endpoint (for testing)
    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        table: TableRef,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            endpoint: endpoint.into(),
            table,
            timeout: REQUEST_TIMEOUT,
        }
    }

    fn tables_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables",
            self.endpoint, self.table.project_id, self.table.dataset_id
        )
    }

    async fn create_table(&self, token: &str) -> Result<()> {
        let body = json!({
            "tableReference": {
                "projectId": self.table.project_id,
                "datasetId": self.table.dataset_id,
                "tableId": self.table.table_id,
            },
            "schema": { "fields": usage_record_schema() },
            "timePartitioning": { "type": "DAY" },
        });

        self.http
            .post(self.tables_url())
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("Failed to send create table request")?
            .error_for_status()
            .with_context(|| format!("failed to create table {}", self.table))?;

        info!(table = %self.table, "Created consumption table");
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for BigQuerySink {
    async fn ensure_table(&self) -> Result<TableRef> {
        let token = self.tokens.token().await?;
        let url = format!("{}/{}", self.tables_url(), self.table.table_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .timeout(self.timeout)
            .send()
            .await
            .context("Failed to send table metadata request")?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => self.create_table(&token).await?,
            status => bail!(
                "failed to get the metadata for table {}: HTTP {}",
                self.table,
                status
            ),
        }

        Ok(self.table.clone())
    }

    async fn write_batch(&self, table: &TableRef, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            debug!(table = %table, "No usage records to write");
            return Ok(());
        }

        let token = self.tokens.token().await?;
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint, table.project_id, table.dataset_id, table.table_id
        );
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|r| json!({ "json": r }))
            .collect();

        let response: InsertAllResponse = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "rows": rows }))
            .send()
            .await
            .context("Failed to send insertAll request")?
            .error_for_status()
            .with_context(|| format!("error in writing table {}", table))?
            .json()
            .await
            .context("Failed to decode insertAll response")?;

        if !response.insert_errors.is_empty() {
            bail!(
                "{} of {} rows rejected by {}",
                response.insert_errors.len(),
                records.len(),
                table
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use crate::models::{Project, Usage, UsageUnit};
    use chrono::{TimeZone, Utc};

    fn table() -> TableRef {
        TableRef {
            project_id: "billing".to_string(),
            dataset_id: "usage".to_string(),
            table_id: "consumption".to_string(),
        }
    }

    fn sink(server: &mockito::Server) -> BigQuerySink {
        BigQuerySink::with_endpoint(
            reqwest::Client::new(),
            Arc::new(StaticTokenSource::new("token")),
            table(),
            server.url(),
        )
    }

    fn record() -> UsageRecord {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        UsageRecord {
            resource_id: 7,
            region: "us-central1".to_string(),
            cluster_location: "us-central1-a".to_string(),
            cluster_name: "c1".to_string(),
            namespace: "ns1".to_string(),
            resource_name: "cpu".to_string(),
            sku_id: String::new(),
            start_time: t0,
            end_time: t0,
            fraction: 0.125,
            cloud_resource_size: 4,
            labels: vec![],
            project: Project {
                id: "proj".to_string(),
            },
            usage: Usage {
                amount: 90.0,
                unit: UsageUnit::Seconds,
            },
        }
    }

    #[test]
    fn test_schema_is_nullable_and_excludes_internal_fields() {
        let schema = usage_record_schema();
        assert!(schema.iter().all(|f| f.mode != "REQUIRED"));
        assert!(schema.iter().all(|f| f.name != "resource_id" && f.name != "region"));

        let labels = schema.iter().find(|f| f.name == "labels").unwrap();
        assert_eq!(labels.mode, "REPEATED");
        assert_eq!(labels.fields.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_table_existing() {
        let mut server = mockito::Server::new_async().await;
        let get = server
            .mock("GET", "/bigquery/v2/projects/billing/datasets/usage/tables/consumption")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let create = server
            .mock("POST", "/bigquery/v2/projects/billing/datasets/usage/tables")
            .expect(0)
            .create_async()
            .await;

        assert_eq!(sink(&server).ensure_table().await.unwrap(), table());
        get.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_table_creates_missing() {
        let mut server = mockito::Server::new_async().await;
        let _get = server
            .mock("GET", "/bigquery/v2/projects/billing/datasets/usage/tables/consumption")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/bigquery/v2/projects/billing/datasets/usage/tables")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "tableReference": {"tableId": "consumption"},
                "timePartitioning": {"type": "DAY"}
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        sink(&server).ensure_table().await.unwrap();
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_batch_rows() {
        let mut server = mockito::Server::new_async().await;
        let insert = server
            .mock(
                "POST",
                "/bigquery/v2/projects/billing/datasets/usage/tables/consumption/insertAll",
            )
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "rows": [{"json": {"cluster_name": "c1", "usage": {"amount": 90.0, "unit": "seconds"}}}]
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        sink(&server)
            .write_batch(&table(), &[record()])
            .await
            .unwrap();
        insert.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_batch_insert_errors() {
        let mut server = mockito::Server::new_async().await;
        let _insert = server
            .mock(
                "POST",
                "/bigquery/v2/projects/billing/datasets/usage/tables/consumption/insertAll",
            )
            .with_status(200)
            .with_body(r#"{"insertErrors":[{"index":0,"errors":[{"reason":"invalid"}]}]}"#)
            .create_async()
            .await;

        let result = sink(&server).write_batch(&table(), &[record()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_empty_batch_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let insert = server
            .mock(
                "POST",
                "/bigquery/v2/projects/billing/datasets/usage/tables/consumption/insertAll",
            )
            .expect(0)
            .create_async()
            .await;

        sink(&server).write_batch(&table(), &[]).await.unwrap();
        insert.assert_async().await;
    }
}
