//! Cloud Monitoring query client
//!
//! Runs MQL queries through `projects.timeSeries.query` and follows page
//! tokens until the result set is exhausted.

use super::{TelemetrySource, TimeSeriesGroup};
use crate::auth::TokenSource;
use crate::models::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const MONITORING_ENDPOINT: &str = "https://monitoring.googleapis.com";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    time_series_data: Vec<TimeSeriesData>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeriesData {
    #[serde(default)]
    label_values: Vec<LabelValue>,
    #[serde(default)]
    point_data: Vec<PointData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelValue {
    string_value: Option<String>,
    int64_value: Option<String>,
    bool_value: Option<bool>,
}

impl LabelValue {
    fn into_string(self) -> String {
        self.string_value
            .or(self.int64_value)
            .or_else(|| self.bool_value.map(|b| b.to_string()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointData {
    #[serde(default)]
    values: Vec<TypedValue>,
    time_interval: TimeInterval,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: Option<f64>,
    int64_value: Option<String>,
}

impl TypedValue {
    fn as_f64(&self) -> Option<f64> {
        self.double_value
            .or_else(|| self.int64_value.as_deref().and_then(|v| v.parse().ok()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    start_time: Option<DateTime<Utc>>,
    end_time: DateTime<Utc>,
}

impl TimeSeriesData {
    fn into_group(self) -> TimeSeriesGroup {
        let samples = self
            .point_data
            .into_iter()
            .filter_map(|pd| {
                let value = pd.values.first()?.as_f64()?;
                let end = pd.time_interval.end_time;
                let start = pd.time_interval.start_time.unwrap_or(end);
                Some(Sample::new(start, end, value))
            })
            .collect();

        TimeSeriesGroup::new(
            self.label_values
                .into_iter()
                .map(LabelValue::into_string)
                .collect(),
            samples,
        )
    }
}

/// Client for the Cloud Monitoring query API
pub struct MonitoringClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    endpoint: String,
}

impl MonitoringClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_endpoint(http, tokens, MONITORING_ENDPOINT)
    }

    /// Use a custom API endpoint (for testing)
    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            endpoint: endpoint.into(),
        }
    }

    async fn query_page(
        &self,
        url: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<QueryResponse> {
        let token = self.tokens.token().await?;
        self.http
            .post(url)
            .bearer_auth(token)
            .json(&QueryRequest { query, page_token })
            .send()
            .await
            .context("Failed to send time series query")?
            .error_for_status()
            .context("Time series query rejected")?
            .json()
            .await
            .context("Failed to decode time series response")
    }
}

#[async_trait]
impl TelemetrySource for MonitoringClient {
    async fn query(&self, query: &str, project_id: &str) -> Result<Vec<TimeSeriesGroup>> {
        let url = format!(
            "{}/v3/projects/{}/timeSeries:query",
            self.endpoint, project_id
        );

        let mut groups = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .query_page(&url, query, page_token.as_deref())
                .await
                .with_context(|| format!("Could not query time series for project {}", project_id))?;

            groups.extend(page.time_series_data.into_iter().map(TimeSeriesData::into_group));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(project = %project_id, groups = groups.len(), "Time series query complete");
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenSource;
    use chrono::TimeZone;

    const PAGE_ONE: &str = r#"{
        "timeSeriesDescriptor": {},
        "timeSeriesData": [{
            "labelValues": [
                {"stringValue": "proj"}, {"stringValue": "us-central1-a"},
                {"stringValue": "c1"}, {"stringValue": "ns1"},
                {"stringValue": "p1"}, {"stringValue": "ctr"}
            ],
            "pointData": [
                {"values": [{"doubleValue": 0.25}],
                 "timeInterval": {"startTime": "2024-03-01T12:01:00Z", "endTime": "2024-03-01T12:02:00Z"}},
                {"values": [{"doubleValue": 0.5}],
                 "timeInterval": {"startTime": "2024-03-01T12:00:00Z", "endTime": "2024-03-01T12:00:00Z"}}
            ]
        }],
        "nextPageToken": "page-2"
    }"#;

    const PAGE_TWO: &str = r#"{
        "timeSeriesData": [{
            "labelValues": [{"stringValue": "proj"}, {"stringValue": "us-central1-a"}],
            "pointData": [
                {"values": [{"int64Value": "1048576"}],
                 "timeInterval": {"endTime": "2024-03-01T12:00:00Z"}}
            ]
        }]
    }"#;

    fn client(server: &mockito::Server) -> MonitoringClient {
        MonitoringClient::with_endpoint(
            reqwest::Client::new(),
            Arc::new(StaticTokenSource::new("token")),
            server.url(),
        )
    }

    #[tokio::test]
    async fn test_query_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/v3/projects/proj/timeSeries:query")
            .match_header("authorization", "Bearer token")
            .match_body(mockito::Matcher::Json(serde_json::json!({"query": "fetch x"})))
            .with_status(200)
            .with_body(PAGE_ONE)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/v3/projects/proj/timeSeries:query")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"query": "fetch x", "pageToken": "page-2"}),
            ))
            .with_status(200)
            .with_body(PAGE_TWO)
            .create_async()
            .await;

        let groups = client(&server).query("fetch x", "proj").await.unwrap();
        first.assert_async().await;
        second.assert_async().await;

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label_values.len(), 6);
        assert_eq!(groups[0].label_values[4], "p1");
        assert_eq!(groups[0].samples.len(), 2);
        assert_eq!(groups[0].samples[0].value, 0.25);

        // A point without a start time is zero width at its end time
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(groups[1].label_values.len(), 2);
        assert_eq!(groups[1].samples[0], Sample::new(t, t, 1048576.0));
    }

    #[tokio::test]
    async fn test_query_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v3/projects/proj/timeSeries:query")
            .with_status(400)
            .with_body(r#"{"error": {"message": "bad query"}}"#)
            .create_async()
            .await;

        let result = client(&server).query("fetch x", "proj").await;
        assert!(result.is_err());
    }
}
