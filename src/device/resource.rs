//! Scoped memory objects and kernel arguments.

use super::Device;
use crate::backend::{ArgValue, ImageDesc, MemHandle};
use crate::telemetry::Resource;

/// Releases one memory object through its device when dropped.
#[derive(Debug)]
struct MemGuard<'d> {
    device: &'d Device,
    mem: Option<MemHandle>,
    class: Resource,
}

impl<'d> MemGuard<'d> {
    fn handle(&self) -> MemHandle {
        // Only `Drop` clears the handle.
        self.mem.unwrap_or(MemHandle(0))
    }
}

impl Drop for MemGuard<'_> {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            self.device.release_mem(mem, self.class);
        }
    }
}

/// A buffer allocated for the duration of one operation.
#[derive(Debug)]
pub struct DeviceBuffer<'d> {
    guard: MemGuard<'d>,
    size: usize,
}

impl<'d> DeviceBuffer<'d> {
    pub(super) fn new(device: &'d Device, mem: MemHandle, size: usize) -> Self {
        Self {
            guard: MemGuard {
                device,
                mem: Some(mem),
                class: Resource::Buffer,
            },
            size,
        }
    }

    pub fn handle(&self) -> MemHandle {
        self.guard.handle()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Release now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

/// A 2-D image allocated for the duration of one operation.
#[derive(Debug)]
pub struct DeviceImage<'d> {
    guard: MemGuard<'d>,
    desc: ImageDesc,
}

impl<'d> DeviceImage<'d> {
    pub(super) fn new(device: &'d Device, mem: MemHandle, desc: ImageDesc) -> Self {
        Self {
            guard: MemGuard {
                device,
                mem: Some(mem),
                class: Resource::Image,
            },
            desc,
        }
    }

    pub fn handle(&self) -> MemHandle {
        self.guard.handle()
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn release(self) {
        drop(self);
    }
}

/// One positional kernel argument.
///
/// Scalars are passed as their raw bytes; the byte size and layout must match
/// the kernel parameter exactly, as with `clSetKernelArg`.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Mem(MemHandle),
    Bytes(&'a [u8]),
}

impl<'a> KernelArg<'a> {
    pub fn buffer(buffer: &'a DeviceBuffer<'_>) -> Self {
        KernelArg::Mem(buffer.handle())
    }

    pub fn image(image: &'a DeviceImage<'_>) -> Self {
        KernelArg::Mem(image.handle())
    }

    pub fn scalar<T: bytemuck::Pod>(value: &'a T) -> Self {
        KernelArg::Bytes(bytemuck::bytes_of(value))
    }

    pub(super) fn as_value(&self) -> ArgValue<'a> {
        match *self {
            KernelArg::Mem(mem) => ArgValue::Mem(mem),
            KernelArg::Bytes(bytes) => ArgValue::Bytes(bytes),
        }
    }
}

impl<'a, 'd> From<&'a DeviceBuffer<'d>> for KernelArg<'a> {
    fn from(buffer: &'a DeviceBuffer<'d>) -> Self {
        KernelArg::buffer(buffer)
    }
}

impl<'a, 'd> From<&'a DeviceImage<'d>> for KernelArg<'a> {
    fn from(image: &'a DeviceImage<'d>) -> Self {
        KernelArg::image(image)
    }
}
