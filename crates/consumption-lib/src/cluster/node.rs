//! Node metadata extraction
//!
//! Converts node objects into capacity records and parses Kubernetes
//! resource quantities.

use super::NodeInfo;
use crate::models::{ClusterIdentity, NodeCapacityRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const INSTANCE_TYPE_LABELS: &[&str] = &[
    "node.kubernetes.io/instance-type",
    "beta.kubernetes.io/instance-type",
];

const REGION_LABELS: &[&str] = &[
    "topology.kubernetes.io/region",
    "failure-domain.beta.kubernetes.io/region",
];

const PREEMPTIBLE_LABELS: &[&str] = &[
    "cloud.google.com/gke-preemptible",
    "cloud.google.com/gke-spot",
];

/// First value whose key matches, checking `keys` in order
fn read_label(labels: &BTreeMap<String, String>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| labels.get(*key))
        .cloned()
        .unwrap_or_default()
}

fn is_preemptible(labels: &BTreeMap<String, String>) -> Result<bool> {
    for key in PREEMPTIBLE_LABELS {
        let Some(value) = labels.get(*key) else {
            continue;
        };
        let parsed: bool = value
            .parse()
            .with_context(|| format!("invalid value for label {}: {}", key, value))?;
        if parsed {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Build a capacity record for `node` refreshed at `now`
pub fn record_from_node(
    node: &NodeInfo,
    cluster: &ClusterIdentity,
    now: DateTime<Utc>,
) -> Result<NodeCapacityRecord> {
    let preemptible = is_preemptible(&node.labels)
        .with_context(|| format!("unable to check if node {} is preemptible", node.name))?;

    Ok(NodeCapacityRecord {
        project_id: cluster.project_id.clone(),
        cluster_name: cluster.name.clone(),
        cluster_location: cluster.location.clone(),
        node_name: node.name.clone(),
        machine_type: read_label(&node.labels, INSTANCE_TYPE_LABELS),
        preemptible,
        region: read_label(&node.labels, REGION_LABELS),
        cpu_capacity: node.cpu_capacity,
        mem_capacity: node.mem_capacity,
        last_updated: now,
    })
}

const KI: f64 = 1024.0;

/// Parse a Kubernetes quantity (`4`, `3920m`, `16393216Ki`, `1e3`) into its
/// value in base units.
pub fn parse_quantity(quantity: &str) -> Result<f64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        bail!("empty quantity");
    }

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid quantity {:?}", quantity))?;

    // Sub-unit suffixes divide so whole values like `4000m` stay exact
    let value = match suffix {
        "" => number,
        "n" => number / 1e9,
        "u" => number / 1e6,
        "m" => number / 1e3,
        "k" => number * 1e3,
        "M" => number * 1e6,
        "G" => number * 1e9,
        "T" => number * 1e12,
        "P" => number * 1e15,
        "E" => number * 1e18,
        "Ki" => number * KI,
        "Mi" => number * KI.powi(2),
        "Gi" => number * KI.powi(3),
        "Ti" => number * KI.powi(4),
        "Pi" => number * KI.powi(5),
        "Ei" => number * KI.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..]
                .parse()
                .with_context(|| format!("invalid exponent in quantity {:?}", quantity))?;
            if power < 0 {
                number / 10f64.powi(-power)
            } else {
                number * 10f64.powi(power)
            }
        }
        other => bail!("unknown quantity suffix {:?} in {:?}", other, quantity),
    };

    Ok(value)
}

/// Quantity rounded up to a whole number of base units
pub fn parse_quantity_ceil(quantity: &str) -> Result<i64> {
    Ok(parse_quantity(quantity)?.ceil() as i64)
}
