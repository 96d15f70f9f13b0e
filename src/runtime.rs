//! Process-wide device for applications that want one shared instance.

use crate::backend::{default_backend, Backend};
use crate::config::DeviceConfig;
use crate::context::ExecutionContext;
use crate::device::Device;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

// Global device for the simple API
static GLOBAL_DEVICE: RwLock<Option<Arc<Device>>> = RwLock::new(None);

/// Bring up the global device on the default backend and build its program.
pub fn init(config: DeviceConfig) -> Result<()> {
    init_with_backend(default_backend(), config)
}

/// Same as [`init`] on an explicit backend.
///
/// Any failure after device bring-up deinitializes it again, leaving the
/// runtime uninitialized.
pub fn init_with_backend(backend: Arc<dyn Backend>, config: DeviceConfig) -> Result<()> {
    let mut global = GLOBAL_DEVICE.write();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    config.validate()?;
    let device = Device::with_config(backend, config);
    device.init(false)?;

    let built = device.config().kernel_source.load().and_then(|source| {
        info!(
            source = %device.config().kernel_source.describe(),
            bytes = source.len(),
            "building kernels"
        );
        device.init_program(&source)
    });
    if let Err(e) = built {
        device.deinit();
        return Err(e);
    }

    *global = Some(Arc::new(device));
    Ok(())
}

pub fn is_available() -> bool {
    GLOBAL_DEVICE.read().is_some()
}

pub fn device() -> Option<Arc<Device>> {
    GLOBAL_DEVICE.read().clone()
}

/// Create an execution context on the global device.
pub fn create_context() -> Result<ExecutionContext> {
    let device = device().ok_or(Error::NotInitialized)?;
    ExecutionContext::create(&device)
}

/// Deinitialize and drop the global device. Safe to call repeatedly.
pub fn shutdown() {
    let Some(device) = GLOBAL_DEVICE.write().take() else {
        return;
    };

    if Arc::strong_count(&device) > 1 {
        warn!(
            holders = Arc::strong_count(&device) - 1,
            "shutting down while the device is still referenced"
        );
    }
    device.deinit();
}
