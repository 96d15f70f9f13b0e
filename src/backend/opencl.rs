//! [`Backend`] over the system OpenCL driver via `ocl::core`.
//!
//! `ocl::core` objects release themselves on drop, so every `release_*`
//! here just removes the object from its table. Platforms and devices are
//! handed out as indices into tables filled during enumeration.

use super::{
    ArgValue, Backend, BackendError, BackendResult, ChannelOrder, ContextHandle, DeviceId, DeviceProperties,
    DeviceType, FpConfig, ImageDesc, KernelHandle, MemAccess, MemHandle, NdRange, PlatformId, PlatformInfo,
    ProgramHandle, QueueHandle, Status,
};
use ocl::core;
use ocl::core::{ArgVal, Event};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{c_void, CString};

#[derive(Default)]
struct Tables {
    platforms: Vec<core::PlatformId>,
    devices: Vec<core::DeviceId>,
    contexts: HashMap<u64, core::Context>,
    queues: HashMap<u64, core::CommandQueue>,
    programs: HashMap<u64, core::Program>,
    kernels: HashMap<u64, core::Kernel>,
    mems: HashMap<u64, core::Mem>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device_handle(&mut self, device: core::DeviceId) -> DeviceId {
        let index = match self.devices.iter().position(|d| *d == device) {
            Some(i) => i,
            None => {
                self.devices.push(device);
                self.devices.len() - 1
            }
        };
        DeviceId(index as u64)
    }
}

pub struct OclBackend {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for OclBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.tables.lock();
        f.debug_struct("OclBackend")
            .field("platforms", &t.platforms.len())
            .field("devices", &t.devices.len())
            .field("contexts", &t.contexts.len())
            .field("queues", &t.queues.len())
            .field("mems", &t.mems.len())
            .finish()
    }
}

impl OclBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Retained copies of a queue and memory object, so blocking calls run
    /// without the table lock.
    fn queue_and_mem(
        &self,
        call: &'static str,
        queue: QueueHandle,
        mem: MemHandle,
    ) -> BackendResult<(core::CommandQueue, core::Mem)> {
        let t = self.tables.lock();
        let q = t
            .queues
            .get(&queue.0)
            .cloned()
            .ok_or_else(|| missing(call, Status::INVALID_COMMAND_QUEUE))?;
        let m = t
            .mems
            .get(&mem.0)
            .cloned()
            .ok_or_else(|| missing(call, Status::INVALID_MEM_OBJECT))?;
        Ok((q, m))
    }
}

impl Default for OclBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(call: &'static str) -> impl Fn(ocl::core::Error) -> BackendError {
    move |e| {
        let status = e.api_status().map(|s| Status(s as i32)).unwrap_or(Status::INVALID_VALUE);
        BackendError::new(call, status)
    }
}

fn missing(call: &'static str, status: Status) -> BackendError {
    BackendError::new(call, status)
}

fn cl_device_type(device_type: DeviceType) -> core::DeviceType {
    match device_type {
        DeviceType::Gpu => core::DeviceType::GPU,
        DeviceType::Cpu => core::DeviceType::CPU,
        DeviceType::Accelerator => core::DeviceType::ACCELERATOR,
    }
}

fn mem_flags(access: MemAccess) -> core::MemFlags {
    match access {
        MemAccess::ReadOnly => core::MemFlags::new().read_only(),
        MemAccess::WriteOnly => core::MemFlags::new().write_only(),
        MemAccess::ReadWrite => core::MemFlags::new().read_write(),
    }
}

fn image_format(desc: &ImageDesc) -> core::ImageFormat {
    let order = match desc.order {
        ChannelOrder::Luminance => core::ImageChannelOrder::Luminance,
        ChannelOrder::Rg => core::ImageChannelOrder::Rg,
        ChannelOrder::Rgb => core::ImageChannelOrder::Rgb,
        ChannelOrder::Rgba => core::ImageChannelOrder::Rgba,
    };
    let data_type = if desc.normalized {
        core::ImageChannelDataType::UnormInt8
    } else {
        core::ImageChannelDataType::UnsignedInt8
    };
    core::ImageFormat::new(order, data_type)
}

impl Backend for OclBackend {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> BackendResult<Vec<PlatformId>> {
        let ids = core::get_platform_ids().map_err(fail("clGetPlatformIDs"))?;
        let mut t = self.tables.lock();
        t.platforms = ids;
        Ok((0..t.platforms.len() as u64).map(PlatformId).collect())
    }

    fn platform_info(&self, platform: PlatformId) -> BackendResult<PlatformInfo> {
        let call = "clGetPlatformInfo";
        let id = *self
            .tables
            .lock()
            .platforms
            .get(platform.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_PLATFORM))?;

        let query = |what| {
            core::get_platform_info(&id, what)
                .map(|r| r.to_string())
                .map_err(fail(call))
        };
        Ok(PlatformInfo {
            name: query(core::PlatformInfo::Name)?,
            vendor: query(core::PlatformInfo::Vendor)?,
            version: query(core::PlatformInfo::Version)?,
        })
    }

    fn devices(&self, platform: PlatformId, device_type: DeviceType) -> BackendResult<Vec<DeviceId>> {
        let call = "clGetDeviceIDs";
        let id = *self
            .tables
            .lock()
            .platforms
            .get(platform.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_PLATFORM))?;

        let found = match core::get_device_ids(&id, Some(cl_device_type(device_type)), None) {
            Ok(found) => found,
            Err(e) => match e.api_status() {
                Some(s) if s as i32 == Status::DEVICE_NOT_FOUND.0 => Vec::new(),
                _ => return Err(fail(call)(e)),
            },
        };

        let mut t = self.tables.lock();
        Ok(found.into_iter().map(|d| t.device_handle(d)).collect())
    }

    fn device_info(&self, device: DeviceId) -> BackendResult<DeviceProperties> {
        let call = "clGetDeviceInfo";
        let id = *self
            .tables
            .lock()
            .devices
            .get(device.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_DEVICE))?;

        let name = core::get_device_info(&id, core::DeviceInfo::Name)
            .map_err(fail(call))?
            .to_string();

        let device_type = match core::get_device_info(&id, core::DeviceInfo::Type).map_err(fail(call))? {
            core::DeviceInfoResult::Type(t) if t.contains(core::DeviceType::GPU) => DeviceType::Gpu,
            core::DeviceInfoResult::Type(t) if t.contains(core::DeviceType::CPU) => DeviceType::Cpu,
            _ => DeviceType::Accelerator,
        };

        let fp_config = match core::get_device_info(&id, core::DeviceInfo::SingleFpConfig).map_err(fail(call))? {
            core::DeviceInfoResult::SingleFpConfig(cfg) => FpConfig::from_bits_truncate(cfg.bits()),
            _ => FpConfig::empty(),
        };

        Ok(DeviceProperties {
            name,
            device_type,
            fp_config,
        })
    }

    fn create_context(&self, device: DeviceId) -> BackendResult<ContextHandle> {
        let call = "clCreateContext";
        let mut t = self.tables.lock();
        let id = *t
            .devices
            .get(device.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_DEVICE))?;

        let context = core::create_context(None, &[id], None, None).map_err(fail(call))?;
        let handle = t.next_id();
        t.contexts.insert(handle, context);
        Ok(ContextHandle(handle))
    }

    fn release_context(&self, context: ContextHandle) -> BackendResult<()> {
        self.tables
            .lock()
            .contexts
            .remove(&context.0)
            .map(drop)
            .ok_or_else(|| missing("clReleaseContext", Status::INVALID_CONTEXT))
    }

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> BackendResult<QueueHandle> {
        let call = "clCreateCommandQueue";
        let mut t = self.tables.lock();
        let id = *t
            .devices
            .get(device.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_DEVICE))?;
        let ctx = t
            .contexts
            .get(&context.0)
            .ok_or_else(|| missing(call, Status::INVALID_CONTEXT))?;

        let queue = core::create_command_queue(ctx, &id, None).map_err(fail(call))?;
        let handle = t.next_id();
        t.queues.insert(handle, queue);
        Ok(QueueHandle(handle))
    }

    fn release_queue(&self, queue: QueueHandle) -> BackendResult<()> {
        self.tables
            .lock()
            .queues
            .remove(&queue.0)
            .map(drop)
            .ok_or_else(|| missing("clReleaseCommandQueue", Status::INVALID_COMMAND_QUEUE))
    }

    fn create_program(&self, context: ContextHandle, source: &[u8]) -> BackendResult<ProgramHandle> {
        let call = "clCreateProgramWithSource";
        let src = CString::new(source).map_err(|_| missing(call, Status::INVALID_VALUE))?;

        let mut t = self.tables.lock();
        let ctx = t
            .contexts
            .get(&context.0)
            .ok_or_else(|| missing(call, Status::INVALID_CONTEXT))?;

        let program = core::create_program_with_source(ctx, &[src]).map_err(fail(call))?;
        let handle = t.next_id();
        t.programs.insert(handle, program);
        Ok(ProgramHandle(handle))
    }

    fn build_program(&self, program: ProgramHandle, device: DeviceId, options: &str) -> BackendResult<()> {
        let call = "clBuildProgram";
        let options = CString::new(options).map_err(|_| missing(call, Status::INVALID_BUILD_OPTIONS))?;

        let (id, prog) = {
            let t = self.tables.lock();
            let id = *t
                .devices
                .get(device.0 as usize)
                .ok_or_else(|| missing(call, Status::INVALID_DEVICE))?;
            let prog = t
                .programs
                .get(&program.0)
                .cloned()
                .ok_or_else(|| missing(call, Status::INVALID_PROGRAM))?;
            (id, prog)
        };

        core::build_program(&prog, Some(&[id]), &options, None, None).map_err(|e| {
            let status = e
                .api_status()
                .map(|s| Status(s as i32))
                .unwrap_or(Status::BUILD_PROGRAM_FAILURE);
            BackendError::new(call, status)
        })
    }

    fn build_log(&self, program: ProgramHandle, device: DeviceId) -> BackendResult<String> {
        let call = "clGetProgramBuildInfo";
        let t = self.tables.lock();
        let id = *t
            .devices
            .get(device.0 as usize)
            .ok_or_else(|| missing(call, Status::INVALID_DEVICE))?;
        let prog = t
            .programs
            .get(&program.0)
            .ok_or_else(|| missing(call, Status::INVALID_PROGRAM))?;

        match core::get_program_build_info(prog, &id, core::ProgramBuildInfo::BuildLog).map_err(fail(call))? {
            core::ProgramBuildInfoResult::BuildLog(log) => Ok(log),
            other => Ok(other.to_string()),
        }
    }

    fn release_program(&self, program: ProgramHandle) -> BackendResult<()> {
        self.tables
            .lock()
            .programs
            .remove(&program.0)
            .map(drop)
            .ok_or_else(|| missing("clReleaseProgram", Status::INVALID_PROGRAM))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> BackendResult<KernelHandle> {
        let call = "clCreateKernel";
        let mut t = self.tables.lock();
        let prog = t
            .programs
            .get(&program.0)
            .ok_or_else(|| missing(call, Status::INVALID_PROGRAM))?;

        let kernel = core::create_kernel(prog, name).map_err(fail(call))?;
        let handle = t.next_id();
        t.kernels.insert(handle, kernel);
        Ok(KernelHandle(handle))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> BackendResult<()> {
        self.tables
            .lock()
            .kernels
            .remove(&kernel.0)
            .map(drop)
            .ok_or_else(|| missing("clReleaseKernel", Status::INVALID_KERNEL))
    }

    fn create_buffer(&self, context: ContextHandle, access: MemAccess, size: usize) -> BackendResult<MemHandle> {
        let call = "clCreateBuffer";
        let mut t = self.tables.lock();
        let ctx = t
            .contexts
            .get(&context.0)
            .ok_or_else(|| missing(call, Status::INVALID_CONTEXT))?;

        let mem = unsafe { core::create_buffer::<_, u8>(ctx, mem_flags(access), size, None) }.map_err(fail(call))?;
        let handle = t.next_id();
        t.mems.insert(handle, mem);
        Ok(MemHandle(handle))
    }

    fn create_image(
        &self,
        context: ContextHandle,
        access: MemAccess,
        desc: &ImageDesc,
        pixels: Option<&[u8]>,
    ) -> BackendResult<MemHandle> {
        let call = "clCreateImage";
        let mut t = self.tables.lock();
        let ctx = t
            .contexts
            .get(&context.0)
            .ok_or_else(|| missing(call, Status::INVALID_CONTEXT))?;

        let mut flags = mem_flags(access);
        if pixels.is_some() {
            flags = flags.copy_host_ptr();
        }
        let image_desc = core::ImageDescriptor::new(
            core::MemObjectType::Image2d,
            desc.width,
            desc.height,
            0,
            0,
            0,
            0,
            None,
        );

        let mem = unsafe { core::create_image(ctx, flags, &image_format(desc), &image_desc, pixels, None) }
            .map_err(fail(call))?;
        let handle = t.next_id();
        t.mems.insert(handle, mem);
        Ok(MemHandle(handle))
    }

    fn release_mem(&self, mem: MemHandle) -> BackendResult<()> {
        self.tables
            .lock()
            .mems
            .remove(&mem.0)
            .map(drop)
            .ok_or_else(|| missing("clReleaseMemObject", Status::INVALID_MEM_OBJECT))
    }

    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> BackendResult<()> {
        let call = "clEnqueueWriteBuffer";
        let (q, m) = self.queue_and_mem(call, queue, mem)?;

        unsafe { core::enqueue_write_buffer(&q, &m, true, offset, data, None::<Event>, None::<&mut Event>) }
            .map_err(fail(call))
    }

    fn read_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &mut [u8]) -> BackendResult<()> {
        let call = "clEnqueueReadBuffer";
        let (q, m) = self.queue_and_mem(call, queue, mem)?;

        unsafe { core::enqueue_read_buffer(&q, &m, true, offset, data, None::<Event>, None::<&mut Event>) }
            .map_err(fail(call))
    }

    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 2],
        region: [usize; 2],
        data: &mut [u8],
    ) -> BackendResult<()> {
        let call = "clEnqueueReadImage";
        let (q, m) = self.queue_and_mem(call, queue, image)?;

        unsafe {
            core::enqueue_read_image(
                &q,
                &m,
                true,
                [origin[0], origin[1], 0],
                [region[0], region[1], 1],
                0,
                0,
                data,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(fail(call))
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> BackendResult<()> {
        let call = "clSetKernelArg";
        let t = self.tables.lock();
        let k = t
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| missing(call, Status::INVALID_KERNEL))?;

        let arg = match value {
            ArgValue::Mem(mem) => {
                let m = t
                    .mems
                    .get(&mem.0)
                    .ok_or_else(|| missing(call, Status::INVALID_MEM_OBJECT))?;
                ArgVal::mem(m)
            }
            // Size and layout are the caller's contract, exactly as with clSetKernelArg.
            ArgValue::Bytes(bytes) => unsafe {
                ArgVal::from_raw(bytes.len(), bytes.as_ptr() as *const c_void, false)
            },
        };
        core::set_kernel_arg(k, index, arg).map_err(fail(call))
    }

    fn enqueue_kernel(&self, queue: QueueHandle, kernel: KernelHandle, range: &NdRange) -> BackendResult<()> {
        let call = "clEnqueueNDRangeKernel";
        let (q, k) = {
            let t = self.tables.lock();
            let q = t
                .queues
                .get(&queue.0)
                .cloned()
                .ok_or_else(|| missing(call, Status::INVALID_COMMAND_QUEUE))?;
            let k = t
                .kernels
                .get(&kernel.0)
                .cloned()
                .ok_or_else(|| missing(call, Status::INVALID_KERNEL))?;
            (q, k)
        };

        let offset = [range.offset[0], range.offset[1], 0];
        let global = [range.global[0], range.global[1], 1];
        unsafe {
            core::enqueue_kernel(
                &q,
                &k,
                range.dims,
                Some(offset),
                &global,
                None,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(fail(call))
    }

    fn flush(&self, queue: QueueHandle) -> BackendResult<()> {
        let call = "clFlush";
        let q = self
            .tables
            .lock()
            .queues
            .get(&queue.0)
            .cloned()
            .ok_or_else(|| missing(call, Status::INVALID_COMMAND_QUEUE))?;
        core::flush(&q).map_err(fail(call))
    }

    fn finish(&self, queue: QueueHandle) -> BackendResult<()> {
        let call = "clFinish";
        // Cloned (retained) so the table lock is not held while the device drains.
        let q = self
            .tables
            .lock()
            .queues
            .get(&queue.0)
            .cloned()
            .ok_or_else(|| missing(call, Status::INVALID_COMMAND_QUEUE))?;
        core::finish(&q).map_err(fail(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfers_on_unknown_handles() {
        let backend = OclBackend::new();
        let mut out = [0u8; 4];

        let err = backend.write_buffer(QueueHandle(1), MemHandle(2), 0, &[1, 2]).unwrap_err();
        assert_eq!(err.status, Status::INVALID_COMMAND_QUEUE);
        let err = backend.read_buffer(QueueHandle(1), MemHandle(2), 0, &mut out).unwrap_err();
        assert_eq!(err.status, Status::INVALID_COMMAND_QUEUE);
        let err = backend
            .read_image(QueueHandle(1), MemHandle(2), [0, 0], [2, 2], &mut out)
            .unwrap_err();
        assert_eq!(err.call, "clEnqueueReadImage");
        let err = backend.build_program(ProgramHandle(3), DeviceId(0), "").unwrap_err();
        assert_eq!(err.status, Status::INVALID_DEVICE);

        // Lookups hand back retained copies; the tables are free afterwards.
        assert!(backend.tables.try_lock().is_some());
    }
}
