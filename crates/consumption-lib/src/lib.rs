//! Library for GKE consumption export
//!
//! This crate provides the core functionality for:
//! - Querying per-container CPU and memory telemetry
//! - Attributing usage to a fraction of node capacity
//! - Caching cluster clients and node capacity
//! - Periodic export of usage records to an analytics sink
//! - Health checks and observability

pub mod auth;
pub mod calculator;
pub mod cluster;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod resource;
pub mod sink;
pub mod store;
pub mod telemetry;

pub use error::AttributionError;
pub use health::{
    ComponentHealth, ComponentStatus, CycleReport, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
