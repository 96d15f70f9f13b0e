//! clkit - thread-friendly device and context layer for OpenCL-style compute
//!
//! A single [`Device`] owns the platform selection, context and compiled
//! program. Worker threads each take an [`ExecutionContext`] (own command
//! queue, own kernel objects) and submit work through it. Drivers that are
//! unsafe under concurrent use get every backend call serialized behind one
//! process-wide gate, switched on automatically for known vendors or forced
//! by configuration.
//!
//! # Quick Start
//!
//! ```no_run
//! use clkit::prelude::*;
//!
//! clkit::init(DeviceConfig::default()).unwrap();
//!
//! let mut ctx = clkit::create_context().unwrap();
//! let input: Vec<u8> = (0..=255).collect();
//! let mut output = vec![0u8; input.len()];
//! ctx.process_buffer(&input, &mut output).unwrap();
//! assert!(output.iter().all(|&b| b == 0));
//!
//! clkit::destroy_context(Some(ctx));
//! clkit::shutdown();
//! ```
//!
//! # Features
//!
//! - **Backends**: in-process host device by default, the system OpenCL
//!   driver with `opencl`
//! - **Serialization gate**: optional global lock around backend calls
//! - **Scoped resources**: buffers, images, queues and kernels are released on
//!   every exit path
//! - **Telemetry**: resource balance and latency metrics, JSON export (`telemetry`)
//! - **Strict mode**: panic on the first backend failure (`strict`)

#![warn(missing_debug_implementations)]

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod prelude;
pub mod runtime;
pub mod telemetry;

pub use backend::{default_backend, Backend, HostBackend};
pub use config::{DeviceConfig, DeviceConfigBuilder, KernelSource};
pub use context::{destroy_context, ExecutionContext, KERNEL_ENTRY_POINTS};
pub use device::{Device, DeviceInfo};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{create_context, device, init, init_with_backend, is_available, shutdown};
