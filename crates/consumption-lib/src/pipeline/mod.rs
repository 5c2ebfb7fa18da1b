//! Usage attribution pipeline
//!
//! This module contains:
//! - The export cycle that turns telemetry groups into usage records
//! - The scheduler that runs the cycle on a fixed period

mod export;
mod scheduler;

pub use export::{CycleOutcome, ExportConfig, ExportCycle, ExportCycleBuilder};
pub use scheduler::{AttributionScheduler, CycleRunner, SchedulerState};
