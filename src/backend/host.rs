//! In-process software implementation of [`Backend`].
//!
//! The host backend behaves like a conforming OpenCL 1.2 driver for the
//! subset of the API this crate uses: programs are "compiled" by matching
//! the entry points declared in the source against a registry of
//! [`NativeKernel`]s, queues are in-order and execute launches on `finish`
//! (or before a blocking transfer on the same queue), and every object is
//! released exactly when its own release call arrives.
//!
//! It also carries the instrumentation the test-suite relies on: per-call
//! counters, live object accounting, fault injection and a probe recording
//! how many threads were inside the backend at the same time.

use super::kernels::{builtin_kernels, declared_entry_points, BoundArg, HostMemory, KernelArgs, NativeKernel, Param};
use super::{
    ArgValue, Backend, BackendError, BackendResult, ContextHandle, DeviceId, DeviceProperties, DeviceType,
    FpConfig, ImageDesc, KernelHandle, MemAccess, MemHandle, NdRange, PlatformId, PlatformInfo, ProgramHandle,
    QueueHandle, Status,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Every entry point of the host backend, for counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Platforms,
    PlatformInfo,
    Devices,
    DeviceInfo,
    CreateContext,
    ReleaseContext,
    CreateQueue,
    ReleaseQueue,
    CreateProgram,
    BuildProgram,
    BuildLog,
    ReleaseProgram,
    CreateKernel,
    ReleaseKernel,
    CreateBuffer,
    CreateImage,
    ReleaseMem,
    WriteBuffer,
    ReadBuffer,
    ReadImage,
    SetKernelArg,
    EnqueueKernel,
    Flush,
    Finish,
}

impl HostCall {
    /// Name of the OpenCL entry point this call stands for.
    pub fn api_name(self) -> &'static str {
        match self {
            HostCall::Platforms => "clGetPlatformIDs",
            HostCall::PlatformInfo => "clGetPlatformInfo",
            HostCall::Devices => "clGetDeviceIDs",
            HostCall::DeviceInfo => "clGetDeviceInfo",
            HostCall::CreateContext => "clCreateContext",
            HostCall::ReleaseContext => "clReleaseContext",
            HostCall::CreateQueue => "clCreateCommandQueue",
            HostCall::ReleaseQueue => "clReleaseCommandQueue",
            HostCall::CreateProgram => "clCreateProgramWithSource",
            HostCall::BuildProgram => "clBuildProgram",
            HostCall::BuildLog => "clGetProgramBuildInfo",
            HostCall::ReleaseProgram => "clReleaseProgram",
            HostCall::CreateKernel => "clCreateKernel",
            HostCall::ReleaseKernel => "clReleaseKernel",
            HostCall::CreateBuffer => "clCreateBuffer",
            HostCall::CreateImage => "clCreateImage",
            HostCall::ReleaseMem => "clReleaseMemObject",
            HostCall::WriteBuffer => "clEnqueueWriteBuffer",
            HostCall::ReadBuffer => "clEnqueueReadBuffer",
            HostCall::ReadImage => "clEnqueueReadImage",
            HostCall::SetKernelArg => "clSetKernelArg",
            HostCall::EnqueueKernel => "clEnqueueNDRangeKernel",
            HostCall::Flush => "clFlush",
            HostCall::Finish => "clFinish",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostDevice {
    pub name: String,
    pub device_type: DeviceType,
    pub fp_config: FpConfig,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            device_type,
            fp_config: FpConfig::INF_NAN | FpConfig::ROUND_TO_NEAREST | FpConfig::FMA,
        }
    }

    pub fn gpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::Gpu)
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::Cpu)
    }

    pub fn with_fp_config(mut self, fp_config: FpConfig) -> Self {
        self.fp_config = fp_config;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            version: version.into(),
            devices: Vec::new(),
        }
    }

    pub fn device(mut self, device: HostDevice) -> Self {
        self.devices.push(device);
        self
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        HostPlatform::new("clkit host", "clkit", "OpenCL 1.2 clkit-host").device(
            HostDevice::cpu("clkit host device").with_fp_config(
                FpConfig::DENORM
                    | FpConfig::INF_NAN
                    | FpConfig::ROUND_TO_NEAREST
                    | FpConfig::FMA
                    | FpConfig::CORRECTLY_ROUNDED_DIVIDE_SQRT,
            ),
        )
    }
}

/// Number of objects currently alive inside the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub contexts: usize,
    pub queues: usize,
    pub programs: usize,
    pub kernels: usize,
    pub mems: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.contexts + self.queues + self.programs + self.kernels + self.mems
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct ContextObj {
    device: DeviceId,
}

struct Launch {
    kernel: Arc<dyn NativeKernel>,
    args: Vec<BoundArg>,
    range: NdRange,
}

struct QueueObj {
    context: ContextHandle,
    pending: Vec<Launch>,
}

struct ProgramObj {
    context: ContextHandle,
    source: String,
    log: String,
    entry_points: Option<Vec<String>>,
}

struct KernelObj {
    native: Arc<dyn NativeKernel>,
    args: Vec<Option<BoundArg>>,
}

struct MemObj {
    context: ContextHandle,
    data: HostMemory,
    image: Option<ImageDesc>,
}

struct Fault {
    call: HostCall,
    remaining: usize,
    status: Status,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    contexts: HashMap<u64, ContextObj>,
    queues: HashMap<u64, QueueObj>,
    programs: HashMap<u64, ProgramObj>,
    kernels: HashMap<u64, KernelObj>,
    mems: HashMap<u64, MemObj>,
    faults: Vec<Fault>,
    calls: HashMap<HostCall, u64>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Builder for [`HostBackend`]. Starts with no platforms and the builtin kernels.
#[derive(Debug)]
pub struct HostBackendBuilder {
    platforms: Vec<HostPlatform>,
    kernels: Vec<Arc<dyn NativeKernel>>,
}

impl HostBackendBuilder {
    pub fn new() -> Self {
        Self {
            platforms: Vec::new(),
            kernels: builtin_kernels(),
        }
    }

    pub fn platform(mut self, platform: HostPlatform) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Register an additional native kernel; replaces a builtin of the same name.
    pub fn kernel(mut self, kernel: Arc<dyn NativeKernel>) -> Self {
        self.kernels.retain(|k| k.name() != kernel.name());
        self.kernels.push(kernel);
        self
    }

    pub fn build(self) -> HostBackend {
        HostBackend {
            platforms: self.platforms,
            kernels: self.kernels,
            state: Mutex::new(HostState::default()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// Software compute device. See the module documentation.
pub struct HostBackend {
    platforms: Vec<HostPlatform>,
    kernels: Vec<Arc<dyn NativeKernel>>,
    state: Mutex<HostState>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackend")
            .field("platforms", &self.platforms.len())
            .field("kernels", &self.kernels.len())
            .field("live", &self.live_objects())
            .finish()
    }
}

impl Default for HostBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        HostBackendBuilder::new().platform(HostPlatform::default()).build()
    }
}

/// Marks one thread as being inside the backend for the duration of a call.
struct CallProbe<'a> {
    active: &'a AtomicUsize,
}

impl Drop for CallProbe<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl HostBackend {
    pub fn builder() -> HostBackendBuilder {
        HostBackendBuilder::new()
    }

    /// Make the `nth` (1-based) subsequent invocation of `call` fail with `status`.
    pub fn fail_nth(&self, call: HostCall, nth: usize, status: Status) {
        self.state.lock().faults.push(Fault {
            call,
            remaining: nth.max(1),
            status,
        });
    }

    pub fn fail_next(&self, call: HostCall, status: Status) {
        self.fail_nth(call, 1, status);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn call_count(&self, call: HostCall) -> u64 {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            contexts: state.contexts.len(),
            queues: state.queues.len(),
            programs: state.programs.len(),
            kernels: state.kernels.len(),
            mems: state.mems.len(),
        }
    }

    /// Highest number of threads observed inside the backend at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn reset_peak_concurrency(&self) {
        self.peak.store(0, Ordering::Release);
    }

    fn enter(&self, call: HostCall) -> BackendResult<CallProbe<'_>> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let probe = CallProbe { active: &self.active };

        // Widen the window in which overlapping callers can observe each other.
        std::thread::yield_now();

        let mut state = self.state.lock();
        *state.calls.entry(call).or_insert(0) += 1;

        let mut injected = None;
        state.faults.retain_mut(|fault| {
            if injected.is_some() || fault.call != call {
                return true;
            }
            fault.remaining -= 1;
            if fault.remaining == 0 {
                injected = Some(fault.status);
                false
            } else {
                true
            }
        });

        match injected {
            Some(status) => Err(BackendError::new(call.api_name(), status)),
            None => Ok(probe),
        }
    }

    fn platform(&self, platform: PlatformId) -> Option<&HostPlatform> {
        self.platforms.get(platform.0 as usize)
    }

    fn device(&self, device: DeviceId) -> Option<&HostDevice> {
        let platform = self.platforms.get((device.0 >> 32) as usize)?;
        platform.devices.get((device.0 & 0xffff_ffff) as usize)
    }

    fn native(&self, name: &str) -> Option<Arc<dyn NativeKernel>> {
        self.kernels.iter().find(|k| k.name() == name).cloned()
    }

    /// Run and clear every launch queued on `queue`.
    fn drain(&self, call: HostCall, queue: QueueHandle) -> BackendResult<()> {
        let err = |status| BackendError::new(call.api_name(), status);

        let pending = {
            let mut state = self.state.lock();
            let q = state.queues.get_mut(&queue.0).ok_or_else(|| err(Status::INVALID_COMMAND_QUEUE))?;
            std::mem::take(&mut q.pending)
        };

        for launch in pending {
            launch
                .kernel
                .run(&KernelArgs::new(&launch.args), &launch.range)
                .map_err(err)?;
        }
        Ok(())
    }

    fn compile(&self, source: &str, options: &str) -> Result<Vec<String>, String> {
        let mut log = Vec::new();

        for (line_no, line) in source.lines().enumerate() {
            if let Some(rest) = line.trim_start().strip_prefix("#error") {
                log.push(format!("{}: error: {}", line_no + 1, rest.trim()));
            }
        }

        let entry_points = declared_entry_points(source);
        if entry_points.is_empty() {
            log.push("error: program declares no kernel entry points".to_string());
        }
        for name in &entry_points {
            if self.native(name).is_none() {
                log.push(format!("error: kernel '{}' has no implementation on this device", name));
            }
        }

        if log.is_empty() {
            Ok(entry_points)
        } else {
            if !options.is_empty() {
                log.insert(0, format!("build options: {}", options));
            }
            Err(log.join("\n"))
        }
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> BackendResult<Vec<PlatformId>> {
        let _probe = self.enter(HostCall::Platforms)?;
        Ok((0..self.platforms.len() as u64).map(PlatformId).collect())
    }

    fn platform_info(&self, platform: PlatformId) -> BackendResult<PlatformInfo> {
        let _probe = self.enter(HostCall::PlatformInfo)?;
        let p = self
            .platform(platform)
            .ok_or_else(|| BackendError::new("clGetPlatformInfo", Status::INVALID_PLATFORM))?;
        Ok(PlatformInfo {
            name: p.name.clone(),
            vendor: p.vendor.clone(),
            version: p.version.clone(),
        })
    }

    fn devices(&self, platform: PlatformId, device_type: DeviceType) -> BackendResult<Vec<DeviceId>> {
        let _probe = self.enter(HostCall::Devices)?;
        let p = self
            .platform(platform)
            .ok_or_else(|| BackendError::new("clGetDeviceIDs", Status::INVALID_PLATFORM))?;
        Ok(p.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.device_type == device_type)
            .map(|(i, _)| DeviceId((platform.0 << 32) | i as u64))
            .collect())
    }

    fn device_info(&self, device: DeviceId) -> BackendResult<DeviceProperties> {
        let _probe = self.enter(HostCall::DeviceInfo)?;
        let d = self
            .device(device)
            .ok_or_else(|| BackendError::new("clGetDeviceInfo", Status::INVALID_DEVICE))?;
        Ok(DeviceProperties {
            name: d.name.clone(),
            device_type: d.device_type,
            fp_config: d.fp_config,
        })
    }

    fn create_context(&self, device: DeviceId) -> BackendResult<ContextHandle> {
        let _probe = self.enter(HostCall::CreateContext)?;
        if self.device(device).is_none() {
            return Err(BackendError::new("clCreateContext", Status::INVALID_DEVICE));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.contexts.insert(id, ContextObj { device });
        Ok(ContextHandle(id))
    }

    fn release_context(&self, context: ContextHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReleaseContext)?;
        match self.state.lock().contexts.remove(&context.0) {
            Some(_) => Ok(()),
            None => Err(BackendError::new("clReleaseContext", Status::INVALID_CONTEXT)),
        }
    }

    fn create_queue(&self, context: ContextHandle, device: DeviceId) -> BackendResult<QueueHandle> {
        let _probe = self.enter(HostCall::CreateQueue)?;
        let mut state = self.state.lock();
        match state.contexts.get(&context.0) {
            None => return Err(BackendError::new("clCreateCommandQueue", Status::INVALID_CONTEXT)),
            Some(ctx) if ctx.device != device => {
                return Err(BackendError::new("clCreateCommandQueue", Status::INVALID_DEVICE))
            }
            Some(_) => {}
        }
        let id = state.next_id();
        state.queues.insert(
            id,
            QueueObj {
                context,
                pending: Vec::new(),
            },
        );
        Ok(QueueHandle(id))
    }

    fn release_queue(&self, queue: QueueHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReleaseQueue)?;
        let q = self
            .state
            .lock()
            .queues
            .remove(&queue.0)
            .ok_or_else(|| BackendError::new("clReleaseCommandQueue", Status::INVALID_COMMAND_QUEUE))?;

        // Outstanding work still completes; nobody is left to observe its status.
        for launch in q.pending {
            let _ = launch.kernel.run(&KernelArgs::new(&launch.args), &launch.range);
        }
        Ok(())
    }

    fn create_program(&self, context: ContextHandle, source: &[u8]) -> BackendResult<ProgramHandle> {
        let _probe = self.enter(HostCall::CreateProgram)?;
        let err = |status| BackendError::new("clCreateProgramWithSource", status);
        if source.is_empty() {
            return Err(err(Status::INVALID_VALUE));
        }
        let source = std::str::from_utf8(source).map_err(|_| err(Status::INVALID_VALUE))?;

        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.0) {
            return Err(err(Status::INVALID_CONTEXT));
        }
        let id = state.next_id();
        state.programs.insert(
            id,
            ProgramObj {
                context,
                source: source.to_string(),
                log: String::new(),
                entry_points: None,
            },
        );
        Ok(ProgramHandle(id))
    }

    fn build_program(&self, program: ProgramHandle, device: DeviceId, options: &str) -> BackendResult<()> {
        let _probe = self.enter(HostCall::BuildProgram)?;
        let err = |status| BackendError::new("clBuildProgram", status);

        let source = {
            let state = self.state.lock();
            let p = state.programs.get(&program.0).ok_or_else(|| err(Status::INVALID_PROGRAM))?;
            let ctx = state.contexts.get(&p.context.0).ok_or_else(|| err(Status::INVALID_CONTEXT))?;
            if ctx.device != device {
                return Err(err(Status::INVALID_DEVICE));
            }
            p.source.clone()
        };

        let outcome = self.compile(&source, options);

        let mut state = self.state.lock();
        let p = state.programs.get_mut(&program.0).ok_or_else(|| err(Status::INVALID_PROGRAM))?;
        match outcome {
            Ok(entry_points) => {
                p.log = format!("build options: {}\nbuild succeeded", options);
                p.entry_points = Some(entry_points);
                Ok(())
            }
            Err(log) => {
                p.log = log;
                p.entry_points = None;
                Err(err(Status::BUILD_PROGRAM_FAILURE))
            }
        }
    }

    fn build_log(&self, program: ProgramHandle, _device: DeviceId) -> BackendResult<String> {
        let _probe = self.enter(HostCall::BuildLog)?;
        let state = self.state.lock();
        state
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or_else(|| BackendError::new("clGetProgramBuildInfo", Status::INVALID_PROGRAM))
    }

    fn release_program(&self, program: ProgramHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReleaseProgram)?;
        match self.state.lock().programs.remove(&program.0) {
            Some(_) => Ok(()),
            None => Err(BackendError::new("clReleaseProgram", Status::INVALID_PROGRAM)),
        }
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> BackendResult<KernelHandle> {
        let _probe = self.enter(HostCall::CreateKernel)?;
        let err = |status| BackendError::new("clCreateKernel", status);

        let mut state = self.state.lock();
        let p = state.programs.get(&program.0).ok_or_else(|| err(Status::INVALID_PROGRAM))?;
        let entry_points = p
            .entry_points
            .as_ref()
            .ok_or_else(|| err(Status::INVALID_PROGRAM_EXECUTABLE))?;
        if !entry_points.iter().any(|e| e == name) {
            return Err(err(Status::INVALID_KERNEL_NAME));
        }
        let native = self.native(name).ok_or_else(|| err(Status::INVALID_KERNEL_NAME))?;

        let id = state.next_id();
        let arity = native.params().len();
        state.kernels.insert(
            id,
            KernelObj {
                native,
                args: vec![None; arity],
            },
        );
        Ok(KernelHandle(id))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReleaseKernel)?;
        match self.state.lock().kernels.remove(&kernel.0) {
            Some(_) => Ok(()),
            None => Err(BackendError::new("clReleaseKernel", Status::INVALID_KERNEL)),
        }
    }

    fn create_buffer(&self, context: ContextHandle, _access: MemAccess, size: usize) -> BackendResult<MemHandle> {
        let _probe = self.enter(HostCall::CreateBuffer)?;
        let err = |status| BackendError::new("clCreateBuffer", status);
        if size == 0 {
            return Err(err(Status::INVALID_BUFFER_SIZE));
        }

        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.0) {
            return Err(err(Status::INVALID_CONTEXT));
        }
        let id = state.next_id();
        state.mems.insert(
            id,
            MemObj {
                context,
                data: Arc::new(Mutex::new(vec![0u8; size])),
                image: None,
            },
        );
        Ok(MemHandle(id))
    }

    fn create_image(
        &self,
        context: ContextHandle,
        _access: MemAccess,
        desc: &ImageDesc,
        pixels: Option<&[u8]>,
    ) -> BackendResult<MemHandle> {
        let _probe = self.enter(HostCall::CreateImage)?;
        let err = |status| BackendError::new("clCreateImage", status);
        if desc.width == 0 || desc.height == 0 {
            return Err(err(Status::INVALID_IMAGE_SIZE));
        }

        let data = match pixels {
            Some(p) if p.len() < desc.byte_len() => return Err(err(Status::INVALID_VALUE)),
            Some(p) => p[..desc.byte_len()].to_vec(),
            None => vec![0u8; desc.byte_len()],
        };

        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.0) {
            return Err(err(Status::INVALID_CONTEXT));
        }
        let id = state.next_id();
        state.mems.insert(
            id,
            MemObj {
                context,
                data: Arc::new(Mutex::new(data)),
                image: Some(*desc),
            },
        );
        Ok(MemHandle(id))
    }

    fn release_mem(&self, mem: MemHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReleaseMem)?;
        match self.state.lock().mems.remove(&mem.0) {
            Some(_) => Ok(()),
            None => Err(BackendError::new("clReleaseMemObject", Status::INVALID_MEM_OBJECT)),
        }
    }

    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> BackendResult<()> {
        let _probe = self.enter(HostCall::WriteBuffer)?;
        let err = |status| BackendError::new("clEnqueueWriteBuffer", status);
        self.drain(HostCall::WriteBuffer, queue)?;

        let storage = self.mem_storage(queue, mem, err)?;
        let mut bytes = storage.lock();
        let end = offset.checked_add(data.len()).ok_or_else(|| err(Status::INVALID_VALUE))?;
        if end > bytes.len() {
            return Err(err(Status::INVALID_VALUE));
        }
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &mut [u8]) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReadBuffer)?;
        let err = |status| BackendError::new("clEnqueueReadBuffer", status);
        self.drain(HostCall::ReadBuffer, queue)?;

        let storage = self.mem_storage(queue, mem, err)?;
        let bytes = storage.lock();
        let end = offset.checked_add(data.len()).ok_or_else(|| err(Status::INVALID_VALUE))?;
        if end > bytes.len() {
            return Err(err(Status::INVALID_VALUE));
        }
        data.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 2],
        region: [usize; 2],
        data: &mut [u8],
    ) -> BackendResult<()> {
        let _probe = self.enter(HostCall::ReadImage)?;
        let err = |status| BackendError::new("clEnqueueReadImage", status);
        self.drain(HostCall::ReadImage, queue)?;

        let (storage, desc) = {
            let state = self.state.lock();
            let m = state.mems.get(&image.0).ok_or_else(|| err(Status::INVALID_MEM_OBJECT))?;
            let desc = m.image.ok_or_else(|| err(Status::INVALID_MEM_OBJECT))?;
            (m.data.clone(), desc)
        };

        let [x, y] = origin;
        let [w, h] = region;
        if x + w > desc.width || y + h > desc.height {
            return Err(err(Status::INVALID_VALUE));
        }
        let bpp = desc.bytes_per_pixel();
        let row_bytes = w * bpp;
        if data.len() < row_bytes * h {
            return Err(err(Status::INVALID_VALUE));
        }

        let pixels = storage.lock();
        for row in 0..h {
            let src = (y + row) * desc.row_pitch() + x * bpp;
            data[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> BackendResult<()> {
        let _probe = self.enter(HostCall::SetKernelArg)?;
        let err = |status| BackendError::new("clSetKernelArg", status);

        let mut state = self.state.lock();
        let bound = match value {
            ArgValue::Mem(mem) => {
                let m = state.mems.get(&mem.0).ok_or_else(|| err(Status::INVALID_MEM_OBJECT))?;
                BoundArg::Mem(m.data.clone())
            }
            ArgValue::Bytes(bytes) => BoundArg::Bytes(bytes.to_vec()),
        };

        let k = state.kernels.get_mut(&kernel.0).ok_or_else(|| err(Status::INVALID_KERNEL))?;
        let index = index as usize;
        let param = *k.native.params().get(index).ok_or_else(|| err(Status::INVALID_ARG_INDEX))?;
        match (param, &bound) {
            (Param::Mem, BoundArg::Mem(_)) => {}
            (Param::Scalar(size), BoundArg::Bytes(bytes)) if bytes.len() == size => {}
            (Param::Scalar(_), BoundArg::Bytes(_)) => return Err(err(Status::INVALID_ARG_SIZE)),
            _ => return Err(err(Status::INVALID_ARG_VALUE)),
        }
        k.args[index] = Some(bound);
        Ok(())
    }

    fn enqueue_kernel(&self, queue: QueueHandle, kernel: KernelHandle, range: &NdRange) -> BackendResult<()> {
        let _probe = self.enter(HostCall::EnqueueKernel)?;
        let err = |status| BackendError::new("clEnqueueNDRangeKernel", status);
        if range.dims == 0 || range.dims > 2 {
            return Err(err(Status::INVALID_WORK_DIMENSION));
        }
        if range.work_items().unwrap_or(0) == 0 {
            return Err(err(Status::INVALID_GLOBAL_WORK_SIZE));
        }

        let mut state = self.state.lock();
        let k = state.kernels.get(&kernel.0).ok_or_else(|| err(Status::INVALID_KERNEL))?;
        let args = k
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| err(Status::INVALID_KERNEL_ARGS))?;
        let launch = Launch {
            kernel: k.native.clone(),
            args,
            range: *range,
        };

        let q = state.queues.get_mut(&queue.0).ok_or_else(|| err(Status::INVALID_COMMAND_QUEUE))?;
        q.pending.push(launch);
        Ok(())
    }

    fn flush(&self, queue: QueueHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::Flush)?;
        if self.state.lock().queues.contains_key(&queue.0) {
            Ok(())
        } else {
            Err(BackendError::new("clFlush", Status::INVALID_COMMAND_QUEUE))
        }
    }

    fn finish(&self, queue: QueueHandle) -> BackendResult<()> {
        let _probe = self.enter(HostCall::Finish)?;
        self.drain(HostCall::Finish, queue)
    }
}

impl HostBackend {
    /// Storage of `mem`, checking that it belongs to the same context as `queue`.
    fn mem_storage(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        err: impl Fn(Status) -> BackendError,
    ) -> BackendResult<HostMemory> {
        let state = self.state.lock();
        let q = state.queues.get(&queue.0).ok_or_else(|| err(Status::INVALID_COMMAND_QUEUE))?;
        let m = state.mems.get(&mem.0).ok_or_else(|| err(Status::INVALID_MEM_OBJECT))?;
        if m.context != q.context {
            return Err(err(Status::INVALID_CONTEXT));
        }
        Ok(m.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kernels::KERNEL_SOURCE;
    use crate::backend::ChannelOrder;

    fn setup(backend: &HostBackend) -> (DeviceId, ContextHandle, QueueHandle) {
        let platform = backend.platforms().unwrap()[0];
        let device = backend.devices(platform, DeviceType::Cpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        let queue = backend.create_queue(context, device).unwrap();
        (device, context, queue)
    }

    #[test]
    fn test_default_platform() {
        let backend = HostBackend::default();
        let platform = backend.platforms().unwrap()[0];
        assert!(backend.devices(platform, DeviceType::Gpu).unwrap().is_empty());

        let cpu = backend.devices(platform, DeviceType::Cpu).unwrap();
        assert_eq!(cpu.len(), 1);
        let props = backend.device_info(cpu[0]).unwrap();
        assert!(props.fp_config.contains(FpConfig::CORRECTLY_ROUNDED_DIVIDE_SQRT));
    }

    #[test]
    fn test_build_failure_log() {
        let backend = HostBackend::default();
        let (device, context, _queue) = setup(&backend);

        let src = "#error missing include\n__kernel void nope(int x) {}\n";
        let program = backend.create_program(context, src.as_bytes()).unwrap();
        let err = backend.build_program(program, device, "-cl-std=CL1.2").unwrap_err();
        assert_eq!(err.status, Status::BUILD_PROGRAM_FAILURE);

        let log = backend.build_log(program, device).unwrap();
        assert!(log.contains("1: error: missing include"));
        assert!(log.contains("kernel 'nope'"));
        assert!(log.contains("-cl-std=CL1.2"));

        assert_eq!(
            backend.create_kernel(program, "nope").unwrap_err().status,
            Status::INVALID_PROGRAM_EXECUTABLE
        );
    }

    #[test]
    fn test_launch_runs_on_finish() {
        let backend = HostBackend::default();
        let (device, context, queue) = setup(&backend);

        let program = backend.create_program(context, KERNEL_SOURCE.as_bytes()).unwrap();
        backend.build_program(program, device, "").unwrap();
        let kernel = backend.create_kernel(program, "process_buffer").unwrap();

        let input = backend.create_buffer(context, MemAccess::ReadOnly, 4).unwrap();
        let output = backend.create_buffer(context, MemAccess::WriteOnly, 4).unwrap();
        backend.write_buffer(queue, input, 0, &[10, 10, 10, 10]).unwrap();

        backend.set_kernel_arg(kernel, 0, ArgValue::Mem(input)).unwrap();
        backend.set_kernel_arg(kernel, 1, ArgValue::Mem(output)).unwrap();
        assert_eq!(
            backend.enqueue_kernel(queue, kernel, &NdRange::one(4)).unwrap_err().status,
            Status::INVALID_KERNEL_ARGS
        );
        assert_eq!(
            backend
                .set_kernel_arg(kernel, 2, ArgValue::Bytes(&[4, 0]))
                .unwrap_err()
                .status,
            Status::INVALID_ARG_SIZE
        );
        backend
            .set_kernel_arg(kernel, 2, ArgValue::Bytes(&4u32.to_ne_bytes()))
            .unwrap();
        backend.enqueue_kernel(queue, kernel, &NdRange::one(4)).unwrap();
        backend.finish(queue).unwrap();

        let mut out = [0u8; 4];
        backend.read_buffer(queue, output, 0, &mut out).unwrap();
        assert_eq!(out, [10, 11, 8, 9]);
    }

    #[test]
    fn test_fault_injection_nth() {
        let backend = HostBackend::default();
        let (_device, context, _queue) = setup(&backend);

        backend.fail_nth(HostCall::CreateBuffer, 2, Status::OUT_OF_RESOURCES);
        let first = backend.create_buffer(context, MemAccess::ReadOnly, 8);
        let second = backend.create_buffer(context, MemAccess::ReadOnly, 8);
        let third = backend.create_buffer(context, MemAccess::ReadOnly, 8);

        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().status, Status::OUT_OF_RESOURCES);
        assert!(third.is_ok());
        assert_eq!(backend.call_count(HostCall::CreateBuffer), 3);
        assert_eq!(backend.live_objects().mems, 2);
    }

    #[test]
    fn test_release_is_per_object() {
        let backend = HostBackend::default();
        let (_device, context, queue) = setup(&backend);
        let buffer = backend.create_buffer(context, MemAccess::ReadWrite, 16).unwrap();

        backend.release_context(context).unwrap();
        let live = backend.live_objects();
        assert_eq!((live.contexts, live.queues, live.mems), (0, 1, 1));

        backend.release_mem(buffer).unwrap();
        assert_eq!(
            backend.release_mem(buffer).unwrap_err().status,
            Status::INVALID_MEM_OBJECT
        );
        backend.release_queue(queue).unwrap();
        assert!(backend.live_objects().is_empty());
    }

    #[test]
    fn test_image_region_read() {
        let backend = HostBackend::default();
        let (_device, context, queue) = setup(&backend);

        let desc = ImageDesc {
            width: 4,
            height: 3,
            order: ChannelOrder::Rg,
            normalized: false,
        };
        let pixels: Vec<u8> = (0..desc.byte_len() as u8).collect();
        let image = backend
            .create_image(context, MemAccess::ReadOnly, &desc, Some(&pixels))
            .unwrap();

        let mut region = [0u8; 8];
        backend.read_image(queue, image, [1, 1], [2, 2], &mut region).unwrap();
        assert_eq!(region, [10, 11, 12, 13, 18, 19, 20, 21]);

        let mut too_far = [0u8; 8];
        assert!(backend.read_image(queue, image, [3, 2], [2, 2], &mut too_far).is_err());
    }
}
