//! Exporter health
//!
//! Component status is derived from export cycle reports: the telemetry,
//! node cache and sink components reflect how the last completed cycle went,
//! and the scheduler component turns degraded once no cycle has completed
//! within the staleness limit. Served by `/healthz` and `/readyz`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still exporting, with failures in the last cycle
    Degraded,
    Unhealthy,
}

/// Status of one component and when it last changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub since: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: Utc::now(),
        }
    }

    /// Healthy when `failures` is zero, otherwise degraded with `describe(failures)`
    fn from_failures(failures: usize, describe: impl FnOnce(usize) -> String) -> Self {
        if failures == 0 {
            Self::new(ComponentStatus::Healthy, None)
        } else {
            Self::new(ComponentStatus::Degraded, Some(describe(failures)))
        }
    }
}

/// Summary of a completed export cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub records: usize,
    pub skipped: usize,
    pub failed_queries: usize,
    pub cache_write_failures: usize,
    /// Set when the sink rejected the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_error: Option<String>,
}

/// `/healthz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<CycleReport>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        let mut overall = ComponentStatus::Healthy;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => overall = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        overall
    }
}

/// `/readyz` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const TELEMETRY: &str = "telemetry";
    pub const SINK: &str = "sink";
    pub const NODE_CACHE: &str = "node_cache";

    pub const ALL: [&str; 4] = [SCHEDULER, TELEMETRY, SINK, NODE_CACHE];
}

#[derive(Debug)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    last_cycle: Option<CycleReport>,
    ready: bool,
}

/// Shared health state, cloned into the export cycle, the scheduler and the API
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
    stale_after: Option<Duration>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every exporter component starts healthy; not ready until `set_ready`
    pub fn new() -> Self {
        let initial = components::ALL
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ComponentHealth::new(ComponentStatus::Healthy, None),
                )
            })
            .collect();

        Self {
            state: Arc::new(RwLock::new(RegistryState {
                components: initial,
                last_cycle: None,
                ready: false,
            })),
            stale_after: None,
        }
    }

    /// Report the scheduler degraded when the last completed cycle is older
    /// than `limit`
    pub fn with_stale_after(mut self, limit: std::time::Duration) -> Self {
        self.stale_after = Duration::from_std(limit).ok();
        self
    }

    /// Apply a cycle report to the telemetry, node cache and sink components
    pub async fn record_cycle(&self, report: CycleReport) {
        let telemetry = ComponentHealth::from_failures(report.failed_queries, |n| {
            format!("{} telemetry queries failed", n)
        });
        let node_cache = ComponentHealth::from_failures(report.cache_write_failures, |n| {
            format!("{} node capacity writes failed", n)
        });
        let sink = match &report.sink_error {
            None => ComponentHealth::new(ComponentStatus::Healthy, None),
            Some(error) => ComponentHealth::new(ComponentStatus::Degraded, Some(error.clone())),
        };

        let mut state = self.state.write().await;
        for (name, health) in [
            (components::TELEMETRY, telemetry),
            (components::NODE_CACHE, node_cache),
            (components::SINK, sink),
        ] {
            set_component(&mut state.components, name, health);
        }
        state.last_cycle = Some(report);
    }

    pub async fn last_cycle(&self) -> Option<CycleReport> {
        self.state.read().await.last_cycle.clone()
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentHealth::new(ComponentStatus::Healthy, None))
            .await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(
            name,
            ComponentHealth::new(ComponentStatus::Degraded, Some(message.into())),
        )
        .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(
            name,
            ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into())),
        )
        .await;
    }

    async fn set(&self, name: &str, health: ComponentHealth) {
        let mut state = self.state.write().await;
        set_component(&mut state.components, name, health);
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(Utc::now()).await
    }

    async fn health_at(&self, now: DateTime<Utc>) -> HealthResponse {
        let state = self.state.read().await;
        let mut current = state.components.clone();

        if let (Some(limit), Some(report)) = (self.stale_after, &state.last_cycle) {
            let scheduler_running = current
                .get(components::SCHEDULER)
                .map_or(false, |c| c.status == ComponentStatus::Healthy);
            if scheduler_running && now - report.completed_at > limit {
                current.insert(
                    components::SCHEDULER.to_string(),
                    ComponentHealth {
                        status: ComponentStatus::Degraded,
                        message: Some(format!(
                            "No cycle completed since {}",
                            report.completed_at.to_rfc3339()
                        )),
                        since: report.completed_at + limit,
                    },
                );
            }
        }

        HealthResponse {
            status: HealthResponse::compute_status(&current),
            components: current,
            last_cycle: state.last_cycle.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.state.read().await.ready;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Exporter not yet initialized".to_string()),
            };
        }

        if self.health().await.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

/// Replace a component's health, keeping `since` when the status is unchanged
fn set_component(
    components: &mut BTreeMap<String, ComponentHealth>,
    name: &str,
    mut health: ComponentHealth,
) {
    if let Some(previous) = components.get(name) {
        if previous.status == health.status {
            health.since = previous.since;
        }
    }
    components.insert(name.to_string(), health);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(completed_at: DateTime<Utc>) -> CycleReport {
        CycleReport {
            completed_at,
            duration_secs: 1.5,
            records: 12,
            skipped: 0,
            failed_queries: 0,
            cache_write_failures: 0,
            sink_error: None,
        }
    }

    #[tokio::test]
    async fn test_all_components_start_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), components::ALL.len());
        assert!(health.last_cycle.is_none());
    }

    #[tokio::test]
    async fn test_cycle_report_degrades_failing_components() {
        let registry = HealthRegistry::new();
        registry
            .record_cycle(CycleReport {
                failed_queries: 1,
                sink_error: Some("quota exceeded".to_string()),
                ..report(Utc::now())
            })
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::TELEMETRY].message.as_deref(),
            Some("1 telemetry queries failed")
        );
        assert_eq!(
            health.components[components::SINK].message.as_deref(),
            Some("quota exceeded")
        );
        assert_eq!(
            health.components[components::NODE_CACHE].status,
            ComponentStatus::Healthy
        );
        assert_eq!(health.last_cycle.unwrap().records, 12);
    }

    #[tokio::test]
    async fn test_clean_cycle_clears_previous_degradation() {
        let registry = HealthRegistry::new();
        registry
            .record_cycle(CycleReport {
                cache_write_failures: 2,
                ..report(Utc::now())
            })
            .await;
        registry.record_cycle(report(Utc::now())).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unchanged_status_keeps_since() {
        let registry = HealthRegistry::new();
        let before = registry.health().await.components[components::SINK].since;

        registry.record_cycle(report(Utc::now())).await;

        let after = registry.health().await.components[components::SINK].since;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_scheduler_degraded_when_last_cycle_is_stale() {
        let registry =
            HealthRegistry::new().with_stale_after(std::time::Duration::from_secs(7200));
        let completed = Utc::now() - Duration::hours(3);
        registry.record_cycle(report(completed)).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::SCHEDULER].status,
            ComponentStatus::Degraded
        );

        // Within the limit the scheduler is healthy again
        let fresh = registry.health_at(completed + Duration::hours(1)).await;
        assert_eq!(fresh.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_stopped_scheduler_is_not_masked_by_staleness() {
        let registry =
            HealthRegistry::new().with_stale_after(std::time::Duration::from_secs(60));
        registry.record_cycle(report(Utc::now() - Duration::hours(1))).await;
        registry
            .set_unhealthy(components::SCHEDULER, "Scheduler stopped")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_ready_when_set() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;

        let readiness = registry.readiness().await;
        assert!(readiness.ready);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.set_unhealthy(components::TELEMETRY, "Failed").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
    }
}
