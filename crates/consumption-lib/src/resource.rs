//! Resource kinds the exporter attributes
//!
//! Each kind is a row in [`RESOURCE_KINDS`]. The export cycle iterates the
//! table and never branches on the kind itself.

use crate::models::{NodeCapacityRecord, UsageUnit};
use std::time::Duration;

/// Measurement window shared by every query of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    /// Alignment resolution
    pub resolution: Duration,
    /// How far back the window starts
    pub lookback: Duration,
    /// Length of the window
    pub period: Duration,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            resolution: Duration::from_secs(60),
            lookback: Duration::from_secs(75 * 60),
            period: Duration::from_secs(60 * 60),
        }
    }
}

impl QueryWindow {
    pub fn resolution_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.resolution).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

/// Format a duration as an MQL duration literal (`1m`, `75m`, `1h`)
pub fn mql_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

const GROUP_BY: &str = "[resource.project_id, resource.location, resource.cluster_name, \
                        resource.namespace_name, resource.pod_name, resource.container_name]";

fn cpu_query(w: &QueryWindow) -> String {
    let res = mql_duration(w.resolution);
    format!(
        "fetch k8s_container\n\
         | metric 'kubernetes.io/container/cpu/core_usage_time'\n\
         | align rate({res})\n\
         | every {res}\n\
         | group_by {GROUP_BY}, [value_core_usage_time_aggregate: aggregate(value.core_usage_time)]\n\
         | within -{}, {}",
        mql_duration(w.lookback),
        mql_duration(w.period),
    )
}

fn memory_query(w: &QueryWindow) -> String {
    let res = mql_duration(w.resolution);
    format!(
        "fetch k8s_container\n\
         | metric 'kubernetes.io/container/memory/used_bytes'\n\
         | group_by {res}, [value_used_bytes_mean: mean(value.used_bytes)]\n\
         | every {res}\n\
         | group_by {GROUP_BY}, [value_used_bytes_mean_mean: mean(value_used_bytes_mean)]\n\
         | within -{}, {}",
        mql_duration(w.lookback),
        mql_duration(w.period),
    )
}

fn cpu_capacity(node: &NodeCapacityRecord) -> i64 {
    node.cpu_capacity
}

fn mem_capacity(node: &NodeCapacityRecord) -> i64 {
    node.mem_capacity
}

/// Mapping from a resource kind to its query, unit and capacity field
#[derive(Debug, Clone, Copy)]
pub struct ResourceKind {
    /// Kubernetes resource list key written to `resource_name`
    pub name: &'static str,
    pub unit: UsageUnit,
    pub query: fn(&QueryWindow) -> String,
    pub capacity: fn(&NodeCapacityRecord) -> i64,
}

pub const RESOURCE_KINDS: [ResourceKind; 2] = [
    ResourceKind {
        name: "cpu",
        unit: UsageUnit::Seconds,
        query: cpu_query,
        capacity: cpu_capacity,
    },
    ResourceKind {
        name: "memory",
        unit: UsageUnit::ByteSeconds,
        query: memory_query,
        capacity: mem_capacity,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mql_duration() {
        assert_eq!(mql_duration(Duration::from_secs(60)), "1m");
        assert_eq!(mql_duration(Duration::from_secs(75 * 60)), "75m");
        assert_eq!(mql_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(mql_duration(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn test_queries_use_window_parameters() {
        let window = QueryWindow::default();
        let cpu = (RESOURCE_KINDS[0].query)(&window);
        assert!(cpu.contains("cpu/core_usage_time"));
        assert!(cpu.contains("align rate(1m)"));
        assert!(cpu.contains("within -75m, 1h"));

        let mem = (RESOURCE_KINDS[1].query)(&window);
        assert!(mem.contains("memory/used_bytes"));
        assert!(mem.contains("every 1m"));
        assert!(mem.contains("resource.container_name"));
    }

    #[test]
    fn test_table_units_and_capacity_fields() {
        let node = NodeCapacityRecord {
            project_id: "p".into(),
            cluster_name: "c".into(),
            cluster_location: "l".into(),
            node_name: "n".into(),
            machine_type: String::new(),
            preemptible: false,
            region: String::new(),
            cpu_capacity: 8,
            mem_capacity: 1024,
            last_updated: chrono::Utc::now(),
        };

        let cpu = &RESOURCE_KINDS[0];
        assert_eq!(cpu.unit, UsageUnit::Seconds);
        assert_eq!((cpu.capacity)(&node), 8);

        let mem = &RESOURCE_KINDS[1];
        assert_eq!(mem.unit, UsageUnit::ByteSeconds);
        assert_eq!((mem.capacity)(&node), 1024);
    }
}
