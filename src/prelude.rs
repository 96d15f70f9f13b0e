pub use crate::backend::{Backend, DeviceType, HostBackend};
pub use crate::config::{DeviceConfig, KernelSource};
pub use crate::context::{destroy_context, ExecutionContext};
pub use crate::device::{Device, DeviceBuffer, DeviceImage, DeviceInfo, KernelArg};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::{create_context, init, init_with_backend, is_available, shutdown};

pub use crate::telemetry::{DeviceMetrics, MetricsSnapshot};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::JsonExporter;
