//! The raw compute API the device layer is written against.
//!
//! [`Backend`] mirrors the OpenCL 1.2 C API one method per entry point, with
//! opaque `Copy` handles in place of `cl_*` pointers. Two implementations ship:
//! [`HostBackend`], an in-process software device, and (with the `opencl`
//! feature) `OclBackend`, which forwards to a real OpenCL driver.

pub mod host;
pub mod kernels;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use host::{HostBackend, HostBackendBuilder, HostCall, HostDevice, HostPlatform, LiveObjects};

#[cfg(feature = "opencl")]
pub use opencl::OclBackend;

use std::fmt;
use std::sync::Arc;

/// Numeric status code as returned by the backend (OpenCL `cl_int` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const DEVICE_NOT_FOUND: Status = Status(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Status = Status(-4);
    pub const OUT_OF_RESOURCES: Status = Status(-5);
    pub const OUT_OF_HOST_MEMORY: Status = Status(-6);
    pub const BUILD_PROGRAM_FAILURE: Status = Status(-11);
    pub const INVALID_VALUE: Status = Status(-30);
    pub const INVALID_PLATFORM: Status = Status(-32);
    pub const INVALID_DEVICE: Status = Status(-33);
    pub const INVALID_CONTEXT: Status = Status(-34);
    pub const INVALID_COMMAND_QUEUE: Status = Status(-36);
    pub const INVALID_MEM_OBJECT: Status = Status(-38);
    pub const INVALID_IMAGE_FORMAT_DESCRIPTOR: Status = Status(-39);
    pub const INVALID_IMAGE_SIZE: Status = Status(-40);
    pub const INVALID_BUILD_OPTIONS: Status = Status(-43);
    pub const INVALID_PROGRAM: Status = Status(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Status = Status(-45);
    pub const INVALID_KERNEL_NAME: Status = Status(-46);
    pub const INVALID_KERNEL: Status = Status(-48);
    pub const INVALID_ARG_INDEX: Status = Status(-49);
    pub const INVALID_ARG_VALUE: Status = Status(-50);
    pub const INVALID_ARG_SIZE: Status = Status(-51);
    pub const INVALID_KERNEL_ARGS: Status = Status(-52);
    pub const INVALID_WORK_DIMENSION: Status = Status(-53);
    pub const INVALID_BUFFER_SIZE: Status = Status(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Status = Status(-63);

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Status::SUCCESS => "CL_SUCCESS",
            Status::DEVICE_NOT_FOUND => "CL_DEVICE_NOT_FOUND",
            Status::MEM_OBJECT_ALLOCATION_FAILURE => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            Status::OUT_OF_RESOURCES => "CL_OUT_OF_RESOURCES",
            Status::OUT_OF_HOST_MEMORY => "CL_OUT_OF_HOST_MEMORY",
            Status::BUILD_PROGRAM_FAILURE => "CL_BUILD_PROGRAM_FAILURE",
            Status::INVALID_VALUE => "CL_INVALID_VALUE",
            Status::INVALID_PLATFORM => "CL_INVALID_PLATFORM",
            Status::INVALID_DEVICE => "CL_INVALID_DEVICE",
            Status::INVALID_CONTEXT => "CL_INVALID_CONTEXT",
            Status::INVALID_COMMAND_QUEUE => "CL_INVALID_COMMAND_QUEUE",
            Status::INVALID_MEM_OBJECT => "CL_INVALID_MEM_OBJECT",
            Status::INVALID_IMAGE_FORMAT_DESCRIPTOR => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
            Status::INVALID_IMAGE_SIZE => "CL_INVALID_IMAGE_SIZE",
            Status::INVALID_BUILD_OPTIONS => "CL_INVALID_BUILD_OPTIONS",
            Status::INVALID_PROGRAM => "CL_INVALID_PROGRAM",
            Status::INVALID_PROGRAM_EXECUTABLE => "CL_INVALID_PROGRAM_EXECUTABLE",
            Status::INVALID_KERNEL_NAME => "CL_INVALID_KERNEL_NAME",
            Status::INVALID_KERNEL => "CL_INVALID_KERNEL",
            Status::INVALID_ARG_INDEX => "CL_INVALID_ARG_INDEX",
            Status::INVALID_ARG_VALUE => "CL_INVALID_ARG_VALUE",
            Status::INVALID_ARG_SIZE => "CL_INVALID_ARG_SIZE",
            Status::INVALID_KERNEL_ARGS => "CL_INVALID_KERNEL_ARGS",
            Status::INVALID_WORK_DIMENSION => "CL_INVALID_WORK_DIMENSION",
            Status::INVALID_BUFFER_SIZE => "CL_INVALID_BUFFER_SIZE",
            Status::INVALID_GLOBAL_WORK_SIZE => "CL_INVALID_GLOBAL_WORK_SIZE",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// A single failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{call}() failed with {status}")]
pub struct BackendError {
    pub call: &'static str,
    pub status: Status,
}

impl BackendError {
    pub fn new(call: &'static str, status: Status) -> Self {
        Self { call, status }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

macro_rules! handle_types {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

handle_types! {
    /// Platform (driver/vendor) handle.
    PlatformId,
    /// Physical device handle.
    DeviceId,
    /// Logical context handle.
    ContextHandle,
    /// Command queue handle.
    QueueHandle,
    /// Program handle.
    ProgramHandle,
    /// Kernel handle.
    KernelHandle,
    /// Buffer or image handle.
    MemHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Gpu,
    Cpu,
    Accelerator,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Gpu => "GPU",
            DeviceType::Cpu => "CPU",
            DeviceType::Accelerator => "accelerator",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    /// Single precision floating point capabilities (`CL_DEVICE_SINGLE_FP_CONFIG`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FpConfig: u64 {
        const DENORM = 1 << 0;
        const INF_NAN = 1 << 1;
        const ROUND_TO_NEAREST = 1 << 2;
        const ROUND_TO_ZERO = 1 << 3;
        const ROUND_TO_INF = 1 << 4;
        const FMA = 1 << 5;
        const SOFT_FLOAT = 1 << 6;
        const CORRECTLY_ROUNDED_DIVIDE_SQRT = 1 << 7;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub device_type: DeviceType,
    pub fp_config: FpConfig,
}

/// Kernel-side access to a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Luminance,
    Rg,
    Rgb,
    Rgba,
}

impl ChannelOrder {
    /// Channel order for 8-bit-per-channel pixels of the given width.
    pub fn for_bytes_per_pixel(bytes_per_pixel: u32) -> Option<Self> {
        match bytes_per_pixel {
            1 => Some(ChannelOrder::Luminance),
            2 => Some(ChannelOrder::Rg),
            3 => Some(ChannelOrder::Rgb),
            4 => Some(ChannelOrder::Rgba),
            _ => None,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            ChannelOrder::Luminance => 1,
            ChannelOrder::Rg => 2,
            ChannelOrder::Rgb => 3,
            ChannelOrder::Rgba => 4,
        }
    }
}

/// 2-D image with 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    pub order: ChannelOrder,
    /// `CL_UNORM_INT8` when set, `CL_UNSIGNED_INT8` otherwise.
    pub normalized: bool,
}

impl ImageDesc {
    pub fn bytes_per_pixel(&self) -> usize {
        self.order.channels()
    }

    pub fn row_pitch(&self) -> usize {
        self.width * self.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.row_pitch() * self.height
    }

    /// [`byte_len`](Self::byte_len), or `None` when it does not fit in `usize`.
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.width.checked_mul(self.bytes_per_pixel())?.checked_mul(self.height)
    }
}

/// Global work size and origin of a 1-D or 2-D launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub dims: u32,
    pub offset: [usize; 2],
    pub global: [usize; 2],
}

impl NdRange {
    pub fn one(items: usize) -> Self {
        Self {
            dims: 1,
            offset: [0, 0],
            global: [items, 1],
        }
    }

    pub fn two(width: usize, height: usize, offset: Option<[usize; 2]>) -> Self {
        Self {
            dims: 2,
            offset: offset.unwrap_or([0, 0]),
            global: [width, height],
        }
    }

    /// Total work items, or `None` if the count or the last index overflows.
    pub fn work_items(&self) -> Option<usize> {
        self.offset[0].checked_add(self.global[0])?;
        self.offset[1].checked_add(self.global[1])?;
        self.global[0].checked_mul(self.global[1])
    }
}

/// Value bound to one kernel parameter: a memory object or raw bytes whose
/// size must match the kernel's declared parameter.
#[derive(Debug, Clone, Copy)]
pub enum ArgValue<'a> {
    Mem(MemHandle),
    Bytes(&'a [u8]),
}

/// One-to-one mirror of the compute API entry points the device layer needs.
///
/// Implementations must be callable from many threads at once; whether the
/// underlying driver is actually safe under that load is the device layer's
/// concern (see `device::gate`). Enumerating a device type with no matches
/// returns an empty list rather than `CL_DEVICE_NOT_FOUND`.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn platforms(&self) -> BackendResult<Vec<PlatformId>>;
    fn platform_info(&self, platform: PlatformId) -> BackendResult<PlatformInfo>;
    fn devices(&self, platform: PlatformId, device_type: DeviceType) -> BackendResult<Vec<DeviceId>>;
    fn device_info(&self, device: DeviceId) -> BackendResult<DeviceProperties>;

    fn create_context(&self, device: DeviceId) -> BackendResult<ContextHandle>;
    fn release_context(&self, context: ContextHandle) -> BackendResult<()>;

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> BackendResult<QueueHandle>;
    fn release_queue(&self, queue: QueueHandle) -> BackendResult<()>;

    fn create_program(&self, context: ContextHandle, source: &[u8]) -> BackendResult<ProgramHandle>;
    fn build_program(&self, program: ProgramHandle, device: DeviceId, options: &str) -> BackendResult<()>;
    fn build_log(&self, program: ProgramHandle, device: DeviceId) -> BackendResult<String>;
    fn release_program(&self, program: ProgramHandle) -> BackendResult<()>;

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> BackendResult<KernelHandle>;
    fn release_kernel(&self, kernel: KernelHandle) -> BackendResult<()>;

    fn create_buffer(&self, context: ContextHandle, access: MemAccess, size: usize) -> BackendResult<MemHandle>;
    fn create_image(
        &self,
        context: ContextHandle,
        access: MemAccess,
        desc: &ImageDesc,
        pixels: Option<&[u8]>,
    ) -> BackendResult<MemHandle>;
    fn release_mem(&self, mem: MemHandle) -> BackendResult<()>;

    /// Blocking write of `data` at `offset`.
    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> BackendResult<()>;
    /// Blocking read into `data` from `offset`.
    fn read_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &mut [u8]) -> BackendResult<()>;
    /// Blocking read of a `region` (width, height) starting at `origin` (x, y), tightly packed.
    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 2],
        region: [usize; 2],
        data: &mut [u8],
    ) -> BackendResult<()>;

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> BackendResult<()>;
    fn enqueue_kernel(&self, queue: QueueHandle, kernel: KernelHandle, range: &NdRange) -> BackendResult<()>;

    fn flush(&self, queue: QueueHandle) -> BackendResult<()>;
    fn finish(&self, queue: QueueHandle) -> BackendResult<()>;
}

/// The backend used by `runtime::init`: the system OpenCL driver when built
/// with the `opencl` feature, the in-process host device otherwise.
pub fn default_backend() -> Arc<dyn Backend> {
    #[cfg(feature = "opencl")]
    return Arc::new(OclBackend::new());

    #[cfg(not(feature = "opencl"))]
    Arc::new(HostBackend::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::INVALID_KERNEL_NAME.to_string(), "CL_INVALID_KERNEL_NAME (-46)");
        assert_eq!(Status(-9999).to_string(), "status -9999");
    }

    #[test]
    fn test_channel_order_from_bpp() {
        assert_eq!(ChannelOrder::for_bytes_per_pixel(1), Some(ChannelOrder::Luminance));
        assert_eq!(ChannelOrder::for_bytes_per_pixel(4), Some(ChannelOrder::Rgba));
        assert_eq!(ChannelOrder::for_bytes_per_pixel(5), None);

        let desc = ImageDesc {
            width: 8,
            height: 4,
            order: ChannelOrder::Rgb,
            normalized: false,
        };
        assert_eq!(desc.row_pitch(), 24);
        assert_eq!(desc.byte_len(), 96);
        assert_eq!(desc.checked_byte_len(), Some(96));

        let huge = ImageDesc {
            width: usize::MAX / 2,
            ..desc
        };
        assert_eq!(huge.checked_byte_len(), None);
    }

    #[test]
    fn test_nd_range() {
        let r = NdRange::two(16, 2, Some([4, 1]));
        assert_eq!(r.work_items(), Some(32));
        assert_eq!(r.offset, [4, 1]);
        assert_eq!(NdRange::one(7).global, [7, 1]);

        assert_eq!(NdRange::two(usize::MAX, 2, None).work_items(), None);
        assert_eq!(NdRange::two(8, 1, Some([usize::MAX, 0])).work_items(), None);
    }
}
