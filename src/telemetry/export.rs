//! Metrics export functionality.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};

/// Trait for exporting metrics to different formats
pub trait MetricsExporter: Send + Sync {
    /// Export a metrics snapshot
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Export metrics to a JSON file
#[derive(Debug)]
pub struct JsonExporter {
    output_path: std::path::PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let json = to_json(snapshot)?;
        std::fs::write(&self.output_path, json)?;
        Ok(())
    }
}

/// Render a snapshot as pretty-printed JSON.
pub fn to_json(snapshot: &MetricsSnapshot) -> Result<String> {
    serde_json::to_string_pretty(&SerializableSnapshot::from(snapshot))
        .map_err(|e| Error::config(format!("JSON serialization failed: {}", e)))
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
struct ResourceCount {
    created: u64,
    released: u64,
    live: u64,
}

impl From<(u64, u64)> for ResourceCount {
    fn from((created, released): (u64, u64)) -> Self {
        Self {
            created,
            released,
            live: created.saturating_sub(released),
        }
    }
}

/// Serializable version of MetricsSnapshot
#[derive(Debug, Clone, serde::Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    queues: ResourceCount,
    kernels: ResourceCount,
    buffers: ResourceCount,
    images: ResourceCount,
    programs: ResourceCount,
    bytes_uploaded: u64,
    bytes_downloaded: u64,
    dispatches: u64,
    backend_failures: u64,
    operations: u64,
    avg_latency_us: f64,
    p50_latency_us: f64,
    p99_latency_us: f64,
    max_latency_us: f64,
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: snapshot.uptime.as_secs_f64(),
            queues: snapshot.queues.into(),
            kernels: snapshot.kernels.into(),
            buffers: snapshot.buffers.into(),
            images: snapshot.images.into(),
            programs: snapshot.programs.into(),
            bytes_uploaded: snapshot.bytes_uploaded,
            bytes_downloaded: snapshot.bytes_downloaded,
            dispatches: snapshot.dispatches,
            backend_failures: snapshot.backend_failures,
            operations: snapshot.operations,
            avg_latency_us: snapshot.avg_latency_ns as f64 / 1_000.0,
            p50_latency_us: snapshot.p50_latency_ns as f64 / 1_000.0,
            p99_latency_us: snapshot.p99_latency_ns as f64 / 1_000.0,
            max_latency_us: snapshot.max_latency_ns as f64 / 1_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{DeviceMetrics, Resource};

    #[test]
    fn test_json_export() {
        let metrics = DeviceMetrics::new();
        metrics.record_created(Resource::Buffer);
        metrics.record_upload(64);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        JsonExporter::new(&path).export(&metrics.snapshot()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["buffers"]["live"], 1);
        assert_eq!(value["bytes_uploaded"], 64);
    }
}
