//! Usage calculation
//!
//! Turns a normalized sample window into a usage summary and attributes the
//! summary against a node's capacity. Both operations are pure.

use crate::error::AttributionError;
use crate::models::{SampleWindow, UsageSummary};

/// Aggregate a sorted window into its integrated and mean value.
///
/// The window must already be normalized; see [`SampleWindow::normalize`].
pub fn aggregate(window: &SampleWindow) -> Result<UsageSummary, AttributionError> {
    let samples = window.samples();
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(AttributionError::EmptyWindow),
    };

    let mut integrated = 0.0;
    let mut total = 0.0;
    for sample in samples {
        integrated += sample.value * sample.duration_secs();
        total += sample.value;
    }

    Ok(UsageSummary {
        start_time: first.start,
        end_time: last.end,
        integrated_value: integrated,
        mean_value: total / samples.len() as f64,
    })
}

/// Fraction of `capacity` consumed on average over the summary's window
pub fn attribute(
    summary: &UsageSummary,
    capacity: i64,
    node: &str,
    resource: &str,
) -> Result<f64, AttributionError> {
    if capacity <= 0 {
        return Err(AttributionError::ZeroCapacity {
            node: node.to_string(),
            resource: resource.to_string(),
        });
    }

    Ok(summary.mean_value / capacity as f64)
}
