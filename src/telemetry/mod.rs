//! Resource accounting and dispatch timing.
//!
//! Every device owns a [`DeviceMetrics`]; the counters are always collected.
//! JSON export is available with the `telemetry` feature.

pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod export;

pub use metrics::{DeviceMetrics, MetricsSnapshot, Resource};

#[cfg(feature = "telemetry")]
pub use export::{to_json, JsonExporter, MetricsExporter};
