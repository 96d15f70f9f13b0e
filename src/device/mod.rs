//! Device discovery, program compilation and raw resource operations.
//!
//! A [`Device`] owns the platform/device selection, the single context, a
//! default command queue and at most one built program. Everything else
//! (queues, kernels, buffers, images) is created on behalf of callers and
//! routed through the [`SerializationGate`].
//!
//! Lifecycle: `Uninitialized -> init -> Initialized -> init_program ->
//! ProgramReady -> deinit -> Uninitialized`. `init`, `init_program` and
//! `deinit` take the state write lock; every other operation takes it for
//! reading, so they may run concurrently from any number of threads.

pub mod gate;
mod resource;

pub use gate::{GateGuard, SerializationGate};
pub use resource::{DeviceBuffer, DeviceImage, KernelArg};

use crate::backend::{
    Backend, BackendError, BackendResult, ChannelOrder, ContextHandle, DeviceId, DeviceType, FpConfig,
    ImageDesc, KernelHandle, MemAccess, MemHandle, NdRange, PlatformId, PlatformInfo, ProgramHandle,
    QueueHandle,
};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::telemetry::{DeviceMetrics, Resource};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What `init` discovered about the selected platform and device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform_name: String,
    pub platform_vendor: String,
    pub platform_version: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub fp_config: FpConfig,
    /// Whether backend calls go through the serialization gate.
    pub serialized: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    device: Option<DeviceId>,
    context: Option<ContextHandle>,
    queue: Option<QueueHandle>,
    program: Option<ProgramHandle>,
    info: Option<DeviceInfo>,
}

impl DeviceState {
    fn live(&self) -> Result<(DeviceId, ContextHandle)> {
        match (self.device, self.context, self.queue) {
            (Some(device), Some(context), Some(_)) => Ok((device, context)),
            _ => Err(Error::NotInitialized),
        }
    }

    fn is_initialized(&self) -> bool {
        self.live().is_ok()
    }
}

#[derive(Debug)]
pub struct Device {
    backend: Arc<dyn Backend>,
    config: DeviceConfig,
    state: RwLock<DeviceState>,
    gate: SerializationGate,
    metrics: DeviceMetrics,
    live_contexts: AtomicUsize,
}

impl Device {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, DeviceConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: DeviceConfig) -> Self {
        Self {
            backend,
            config,
            state: RwLock::new(DeviceState::default()),
            gate: SerializationGate::new(false),
            metrics: DeviceMetrics::new(),
            live_contexts: AtomicUsize::new(0),
        }
    }

    /// Discover a platform and device and create the context and default queue.
    ///
    /// `force_serialize` switches the gate on regardless of vendor detection.
    /// On failure everything created so far is released and the device stays
    /// uninitialized. Calling this on an initialized device is a misuse and
    /// fails with [`Error::AlreadyInitialized`] without touching its state.
    pub fn init(&self, force_serialize: bool) -> Result<()> {
        let mut state = self.state.write();
        if state.is_initialized() {
            error!("Device::init called twice without deinit");
            return Err(Error::AlreadyInitialized);
        }

        let mut staged = DeviceState::default();
        match self.bring_up(&mut staged, force_serialize || self.config.force_serialize) {
            Ok(()) => {
                *state = staged;
                Ok(())
            }
            Err(e) => {
                self.tear_down(&mut staged);
                self.gate.set_active(false);
                Err(e)
            }
        }
    }

    fn bring_up(&self, staged: &mut DeviceState, force_serialize: bool) -> Result<()> {
        let platforms = self
            .backend
            .platforms()
            .map_err(|e| Error::Enumeration(self.report(e)))?;

        if platforms.is_empty() {
            error!(backend = self.backend.name(), "no compute platforms available");
            return Err(Error::NoPlatform);
        }

        let candidates = if self.config.scan_all_platforms {
            &platforms[..]
        } else {
            &platforms[..1]
        };
        let (platform, device) = self.select_device(candidates)?;
        debug!(platform = platform.raw(), device = device.raw(), "selected device");

        let platform_info = match self.backend.platform_info(platform) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "platform info unavailable; vendor detection disabled");
                PlatformInfo {
                    name: String::new(),
                    vendor: String::new(),
                    version: String::new(),
                }
            }
        };
        info!(
            platform = %platform_info.name,
            version = %platform_info.version,
            "using compute platform"
        );

        let props = self
            .backend
            .device_info(device)
            .map_err(|e| Error::Enumeration(self.report(e)))?;

        let serialized = force_serialize || self.config.wants_serialization(&platform_info.version);
        info!(serialized, "serializing backend calls across threads: {}", serialized);

        staged.device = Some(device);

        let context = self
            .backend
            .create_context(device)
            .map_err(|e| Error::ContextCreationFailed(self.report(e)))?;
        staged.context = Some(context);

        let queue = self
            .backend
            .create_queue(context, device)
            .map_err(|e| Error::QueueCreationFailed(self.report(e)))?;
        staged.queue = Some(queue);
        self.metrics.record_created(Resource::Queue);

        self.gate.set_active(serialized);

        info!(
            device = %props.name,
            device_type = %props.device_type,
            "device initialized"
        );
        staged.info = Some(DeviceInfo {
            platform_name: platform_info.name,
            platform_vendor: platform_info.vendor,
            platform_version: platform_info.version,
            device_name: props.name,
            device_type: props.device_type,
            fp_config: props.fp_config,
            serialized,
        });
        Ok(())
    }

    fn select_device(&self, platforms: &[PlatformId]) -> Result<(PlatformId, DeviceId)> {
        for &platform in platforms {
            for (rank, &device_type) in self.config.device_preference.iter().enumerate() {
                let devices = self
                    .backend
                    .devices(platform, device_type)
                    .map_err(|e| Error::Enumeration(self.report(e)))?;

                if let Some(&device) = devices.first() {
                    if rank > 0 {
                        warn!(device_type = %device_type, "preferred device type unavailable, falling back");
                    }
                    return Ok((platform, device));
                }
                debug!(platform = platform.raw(), device_type = %device_type, "no device of this type");
            }
        }

        error!("no usable compute device found");
        Err(Error::NoDevice)
    }

    /// Release the program, default queue and context, in that order.
    fn tear_down(&self, state: &mut DeviceState) {
        if let Some(program) = state.program.take() {
            self.release(Resource::Program, |b| b.release_program(program));
        }
        if let Some(queue) = state.queue.take() {
            self.release(Resource::Queue, |b| b.release_queue(queue));
        }
        if let Some(context) = state.context.take() {
            let _gate = self.gate.enter();
            if let Err(e) = self.backend.release_context(context) {
                self.report(e);
            }
        }
        state.device = None;
        state.info = None;
    }

    /// Release everything `init` and `init_program` created. A no-op when
    /// uninitialized; calling it twice is harmless.
    pub fn deinit(&self) {
        let mut state = self.state.write();
        if !state.is_initialized() {
            debug!("deinit on an uninitialized device");
            return;
        }

        let live = self.live_contexts.load(Ordering::Acquire);
        if live > 0 {
            warn!(live, "deinit with execution contexts still alive");
        }

        self.tear_down(&mut state);
        self.gate.set_active(false);
        info!("device deinitialized");
    }

    /// Compile `source` for the selected device, replacing any previous program.
    ///
    /// An empty source fails with [`Error::InvalidSource`] and leaves the
    /// existing program in place. A build failure logs the compiler output,
    /// returns it in [`Error::Compile`] and leaves no program installed.
    pub fn init_program(&self, source: &[u8]) -> Result<()> {
        if source.is_empty() {
            error!("init_program called with empty source");
            return Err(Error::InvalidSource);
        }

        let mut state = self.state.write();
        let (device, context) = state.live()?;
        let fp_config = state.info.as_ref().map(|i| i.fp_config).unwrap_or_default();

        if let Some(old) = state.program.take() {
            self.release(Resource::Program, |b| b.release_program(old));
        }

        let options = self.build_options_for(fp_config);
        let program = self
            .gated(|b| b.create_program(context, source))
            .map_err(|e| Error::resource("program", e))?;
        self.metrics.record_created(Resource::Program);

        // Not routed through `report`: the build log must be out before a strict panic.
        let built = {
            let _gate = self.gate.enter();
            self.backend.build_program(program, device, &options)
        };
        if let Err(e) = built {
            let fetched = {
                let _gate = self.gate.enter();
                self.backend.build_log(program, device)
            };
            let log = fetched.unwrap_or_else(|log_err| {
                self.metrics.record_failure();
                format!("<build log unavailable: {}>", log_err)
            });
            error!(status = %e.status, options = %options, "program build failed:\n{}", log);
            self.release(Resource::Program, |b| b.release_program(program));

            self.metrics.record_failure();
            let err = Error::Compile { status: e.status, log };
            if cfg!(feature = "strict") {
                panic!("{}", err);
            }
            return Err(err);
        }

        info!(options = %options, "program built");
        state.program = Some(program);
        Ok(())
    }

    fn build_options_for(&self, fp_config: FpConfig) -> String {
        let mut options = Vec::with_capacity(self.config.build_options.len() + 1);
        if fp_config.contains(FpConfig::CORRECTLY_ROUNDED_DIVIDE_SQRT) {
            options.push("-cl-fp32-correctly-rounded-divide-sqrt");
        }
        options.extend(self.config.build_options.iter().map(String::as_str));
        options.join(" ")
    }

    /// Program build options for the selected device, `None` before `init`.
    pub fn build_options(&self) -> Option<String> {
        let state = self.state.read();
        state.info.as_ref().map(|info| self.build_options_for(info.fp_config))
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        self.state.read().info.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_initialized()
    }

    pub fn has_program(&self) -> bool {
        let state = self.state.read();
        state.is_initialized() && state.program.is_some()
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_active()
    }

    pub fn gate(&self) -> &SerializationGate {
        &self.gate
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &DeviceMetrics {
        &self.metrics
    }

    /// The queue created by `init`, owned by the device.
    pub fn default_queue(&self) -> Option<QueueHandle> {
        let state = self.state.read();
        state.queue.filter(|_| state.is_initialized())
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::Acquire)
    }

    pub(crate) fn context_opened(&self) {
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_closed(&self) {
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn create_command_queue(&self) -> Result<QueueHandle> {
        let state = self.state.read();
        let (device, context) = state.live()?;

        let queue = self
            .gated(|b| b.create_queue(context, device))
            .map_err(Error::QueueCreationFailed)?;
        self.metrics.record_created(Resource::Queue);
        debug!(queue = queue.raw(), "command queue created");
        Ok(queue)
    }

    pub fn destroy_command_queue(&self, queue: QueueHandle) {
        self.release(Resource::Queue, |b| b.release_queue(queue));
    }

    /// Create a kernel object for the entry point `name` of the built program.
    pub fn create_kernel(&self, name: &str) -> Result<KernelHandle> {
        let state = self.state.read();
        state.live()?;
        let program = state.program.ok_or(Error::ProgramNotLoaded)?;

        let kernel = self
            .gated(|b| b.create_kernel(program, name))
            .map_err(|e| Error::resource("kernel", e))?;
        self.metrics.record_created(Resource::Kernel);
        debug!(kernel = name, "kernel created");
        Ok(kernel)
    }

    pub fn destroy_kernel(&self, kernel: KernelHandle) {
        self.release(Resource::Kernel, |b| b.release_kernel(kernel));
    }

    fn alloc_buffer(&self, access: MemAccess, size: usize) -> Result<DeviceBuffer<'_>> {
        if size == 0 {
            return Err(Error::invalid_argument("buffer size must be non-zero"));
        }

        let state = self.state.read();
        let (_, context) = state.live()?;

        let mem = self
            .gated(|b| b.create_buffer(context, access, size))
            .map_err(|e| Error::resource("buffer", e))?;
        self.metrics.record_created(Resource::Buffer);
        Ok(DeviceBuffer::new(self, mem, size))
    }

    /// Buffer the kernel only reads.
    pub fn alloc_read_buffer(&self, size: usize) -> Result<DeviceBuffer<'_>> {
        self.alloc_buffer(MemAccess::ReadOnly, size)
    }

    /// Buffer the kernel only writes.
    pub fn alloc_write_buffer(&self, size: usize) -> Result<DeviceBuffer<'_>> {
        self.alloc_buffer(MemAccess::WriteOnly, size)
    }

    /// Allocate a read-only buffer and upload `data` into it, both under one
    /// gate acquisition. The buffer is released again if the upload fails.
    pub fn alloc_and_init_read_buffer(&self, queue: QueueHandle, data: &[u8]) -> Result<DeviceBuffer<'_>> {
        if data.is_empty() {
            return Err(Error::invalid_argument("buffer size must be non-zero"));
        }

        let state = self.state.read();
        let (_, context) = state.live()?;

        let (mem, upload) = {
            let _gate = self.gate.enter();
            let mem = self
                .backend
                .create_buffer(context, MemAccess::ReadOnly, data.len())
                .map_err(|e| Error::resource("buffer", self.report(e)))?;
            self.metrics.record_created(Resource::Buffer);
            (mem, self.backend.write_buffer(queue, mem, 0, data))
        };

        let buffer = DeviceBuffer::new(self, mem, data.len());
        upload.map_err(|e| Error::Transfer(self.report(e)))?;
        self.metrics.record_upload(data.len());
        Ok(buffer)
    }

    /// Blocking upload of `data` to the start of `buffer`.
    pub fn write_to_buffer(&self, queue: QueueHandle, buffer: &DeviceBuffer<'_>, data: &[u8]) -> Result<()> {
        if data.len() > buffer.size() {
            return Err(Error::invalid_argument(format!(
                "{} bytes do not fit a {} byte buffer",
                data.len(),
                buffer.size()
            )));
        }

        let state = self.state.read();
        state.live()?;

        self.gated(|b| b.write_buffer(queue, buffer.handle(), 0, data))
            .map_err(Error::Transfer)?;
        self.metrics.record_upload(data.len());
        Ok(())
    }

    /// Blocking download of `out.len()` bytes from the start of `buffer`.
    pub fn read_from_buffer(&self, queue: QueueHandle, buffer: &DeviceBuffer<'_>, out: &mut [u8]) -> Result<()> {
        if out.len() > buffer.size() {
            return Err(Error::invalid_argument(format!(
                "cannot read {} bytes from a {} byte buffer",
                out.len(),
                buffer.size()
            )));
        }

        let state = self.state.read();
        state.live()?;

        self.gated(|b| b.read_buffer(queue, buffer.handle(), 0, out))
            .map_err(Error::Transfer)?;
        self.metrics.record_download(out.len());
        Ok(())
    }

    fn image_desc(width: usize, height: usize, bytes_per_pixel: u32, normalized: bool) -> Result<ImageDesc> {
        let order = ChannelOrder::for_bytes_per_pixel(bytes_per_pixel).ok_or_else(|| {
            Error::invalid_argument(format!("unsupported bytes per pixel: {}", bytes_per_pixel))
        })?;
        if width == 0 || height == 0 {
            return Err(Error::invalid_argument("image dimensions must be non-zero"));
        }
        let desc = ImageDesc {
            width,
            height,
            order,
            normalized,
        };
        if desc.checked_byte_len().is_none() {
            return Err(Error::invalid_argument(format!("{}x{} image is too large", width, height)));
        }
        Ok(desc)
    }

    fn alloc_image(&self, access: MemAccess, desc: ImageDesc, pixels: Option<&[u8]>) -> Result<DeviceImage<'_>> {
        let state = self.state.read();
        let (_, context) = state.live()?;

        let mem = self
            .gated(|b| b.create_image(context, access, &desc, pixels))
            .map_err(|e| Error::resource("image", e))?;
        self.metrics.record_created(Resource::Image);
        if pixels.is_some() {
            self.metrics.record_upload(desc.byte_len());
        }
        Ok(DeviceImage::new(self, mem, desc))
    }

    /// Read-only 2-D image initialised from tightly packed `pixels`, 8 bits
    /// per channel with 1 to 4 channels.
    pub fn create_read_image(
        &self,
        width: usize,
        height: usize,
        pixels: &[u8],
        bytes_per_pixel: u32,
        normalized: bool,
    ) -> Result<DeviceImage<'_>> {
        let desc = Self::image_desc(width, height, bytes_per_pixel, normalized)?;
        if pixels.len() < desc.byte_len() {
            return Err(Error::invalid_argument(format!(
                "{}x{} image needs {} bytes, got {}",
                width,
                height,
                desc.byte_len(),
                pixels.len()
            )));
        }
        self.alloc_image(MemAccess::ReadOnly, desc, Some(&pixels[..desc.byte_len()]))
    }

    pub fn create_write_image(
        &self,
        width: usize,
        height: usize,
        bytes_per_pixel: u32,
        normalized: bool,
    ) -> Result<DeviceImage<'_>> {
        let desc = Self::image_desc(width, height, bytes_per_pixel, normalized)?;
        self.alloc_image(MemAccess::WriteOnly, desc, None)
    }

    /// Blocking read of a `width` x `height` region at (`x`, `y`) into `out`,
    /// tightly packed.
    #[allow(clippy::too_many_arguments)]
    pub fn read_from_image(
        &self,
        queue: QueueHandle,
        image: &DeviceImage<'_>,
        out: &mut [u8],
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<()> {
        let desc = image.desc();
        let inside = matches!(
            (x.checked_add(width), y.checked_add(height)),
            (Some(right), Some(bottom)) if right <= desc.width && bottom <= desc.height
        );
        if !inside {
            return Err(Error::invalid_argument(format!(
                "region {}x{} at ({}, {}) exceeds {}x{} image",
                width, height, x, y, desc.width, desc.height
            )));
        }
        // Bounded by the image, whose byte length was checked at creation.
        let needed = width * height * desc.bytes_per_pixel();
        if out.len() < needed {
            return Err(Error::invalid_argument(format!(
                "region needs {} bytes, got {}",
                needed,
                out.len()
            )));
        }

        let state = self.state.read();
        state.live()?;

        self.gated(|b| b.read_image(queue, image.handle(), [x, y], [width, height], &mut out[..needed]))
            .map_err(Error::Transfer)?;
        self.metrics.record_download(needed);
        Ok(())
    }

    /// Bind `args` to consecutive parameter indices starting at 0, all under
    /// one gate acquisition.
    pub fn set_kernel_args(&self, kernel: KernelHandle, args: &[KernelArg<'_>]) -> Result<()> {
        let _gate = self.gate.enter();
        for (index, arg) in args.iter().enumerate() {
            self.backend
                .set_kernel_arg(kernel, index as u32, arg.as_value())
                .map_err(|e| Error::Dispatch(self.report(e)))?;
        }
        Ok(())
    }

    pub fn run_1d(&self, queue: QueueHandle, kernel: KernelHandle, items: usize) -> Result<()> {
        self.dispatch(queue, kernel, NdRange::one(items))
    }

    pub fn run_2d(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        width: usize,
        height: usize,
        offset: Option<[usize; 2]>,
    ) -> Result<()> {
        self.dispatch(queue, kernel, NdRange::two(width, height, offset))
    }

    fn dispatch(&self, queue: QueueHandle, kernel: KernelHandle, range: NdRange) -> Result<()> {
        match range.work_items() {
            Some(0) => return Err(Error::invalid_argument("empty work range")),
            None => return Err(Error::invalid_argument("work range overflows")),
            Some(_) => {}
        }

        self.gated(|b| b.enqueue_kernel(queue, kernel, &range))
            .map_err(Error::Dispatch)?;
        self.metrics.record_dispatch();
        Ok(())
    }

    /// Submit everything queued on `queue` and wait for it to complete.
    pub fn flush(&self, queue: QueueHandle) -> Result<()> {
        let _gate = self.gate.enter();
        self.backend
            .flush(queue)
            .and_then(|()| self.backend.finish(queue))
            .map_err(|e| Error::Dispatch(self.report(e)))
    }

    pub(crate) fn release_mem(&self, mem: MemHandle, class: Resource) {
        self.release(class, |b| b.release_mem(mem));
    }

    /// Run one backend call under the gate, reporting any failure.
    fn gated<T>(&self, call: impl FnOnce(&dyn Backend) -> BackendResult<T>) -> BackendResult<T> {
        let _gate = self.gate.enter();
        call(self.backend.as_ref()).map_err(|e| self.report(e))
    }

    /// Releases are counted even when the backend complains; the handle is
    /// unusable either way.
    fn release(&self, class: Resource, call: impl FnOnce(&dyn Backend) -> BackendResult<()>) {
        let _ = self.gated(call);
        self.metrics.record_released(class);
    }

    fn report(&self, err: BackendError) -> BackendError {
        self.metrics.record_failure();
        error!(call = err.call, status = %err.status, "backend call failed");

        if cfg!(feature = "strict") {
            panic!("{}", err);
        }
        err
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.state.get_mut().is_initialized() {
            debug!("dropping initialized device");
            self.deinit();
        }
    }
}


#[cfg(all(test, feature = "strict"))]
mod strict_tests {
    use super::*;
    use crate::backend::kernels::KERNEL_SOURCE;
    use crate::backend::{HostBackend, HostCall, Status};

    #[test]
    #[should_panic(expected = "clCreateBuffer")]
    fn test_backend_failure_panics() {
        let backend = Arc::new(HostBackend::default());
        let device = Device::new(backend.clone());
        device.init(false).unwrap();
        device.init_program(KERNEL_SOURCE.as_bytes()).unwrap();

        backend.fail_next(HostCall::CreateBuffer, Status::OUT_OF_RESOURCES);
        let _ = device.alloc_read_buffer(64);
    }

    #[test]
    #[should_panic(expected = "2: error: unbalanced braces")]
    fn test_build_failure_panics_with_log() {
        let device = Device::new(Arc::new(HostBackend::default()));
        device.init(false).unwrap();

        let source = "__kernel void process_buffer(__global const uchar *in)\n#error unbalanced braces\n";
        let _ = device.init_program(source.as_bytes());
    }

    #[test]
    fn test_successful_calls_do_not_panic() {
        let backend = Arc::new(HostBackend::default());
        let device = Device::new(backend.clone());
        device.init(false).unwrap();
        device.init_program(KERNEL_SOURCE.as_bytes()).unwrap();
        device.alloc_write_buffer(16).unwrap().release();
        device.deinit();
        assert!(backend.live_objects().is_empty());
    }
}
