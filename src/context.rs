//! Per-thread execution contexts.
//!
//! An [`ExecutionContext`] bundles a dedicated command queue with one kernel
//! object per entry point in [`KERNEL_ENTRY_POINTS`]. Contexts are cheap to
//! create once the device has a program, are never shared between threads,
//! and release their queue and kernels when dropped.

use crate::backend::{KernelHandle, QueueHandle};
use crate::device::{Device, KernelArg};
use crate::error::{Error, Result};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Kernel entry points every context compiles up front.
pub const KERNEL_ENTRY_POINTS: &[&str] = &["process_buffer"];

#[derive(Debug)]
pub struct ExecutionContext {
    device: Arc<Device>,
    queue: Option<QueueHandle>,
    kernels: Vec<(&'static str, KernelHandle)>,
    // Send, but not Sync: a queue is driven by one thread at a time.
    _not_sync: PhantomData<Cell<()>>,
}

impl ExecutionContext {
    /// Build a context on `device`.
    ///
    /// Fails with [`Error::NotInitialized`] or [`Error::ProgramNotLoaded`]
    /// before any backend call is made. If queue or kernel creation fails,
    /// whatever was created is released before the error is returned.
    pub fn create(device: &Arc<Device>) -> Result<Self> {
        if !device.is_initialized() {
            error!("create_context called before device init");
            return Err(Error::NotInitialized);
        }
        if !device.has_program() {
            error!("create_context called before a program was built");
            return Err(Error::ProgramNotLoaded);
        }

        device.context_opened();
        let mut context = ExecutionContext {
            device: Arc::clone(device),
            queue: None,
            kernels: Vec::with_capacity(KERNEL_ENTRY_POINTS.len()),
            _not_sync: PhantomData,
        };

        context.queue = Some(device.create_command_queue()?);
        for &name in KERNEL_ENTRY_POINTS {
            let kernel = device.create_kernel(name)?;
            context.kernels.push((name, kernel));
        }

        debug!(kernels = context.kernels.len(), "execution context created");
        Ok(context)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The context's own command queue.
    pub fn queue(&self) -> Result<QueueHandle> {
        self.queue.ok_or(Error::NotInitialized)
    }

    pub fn kernel(&self, name: &str) -> Option<KernelHandle> {
        self.kernels.iter().find(|(n, _)| *n == name).map(|&(_, k)| k)
    }

    /// Run the `process_buffer` kernel over `input`, writing the result to
    /// `output`. With the shipped kernel, `output[i] = input[i] ^ (i % 256)`.
    ///
    /// Both device buffers are released on every exit path. `input` and
    /// `output` must have the same non-zero length, at most `u32::MAX`.
    pub fn process_buffer(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        if input.len() != output.len() {
            return Err(Error::invalid_argument(format!(
                "input is {} bytes but output is {}",
                input.len(),
                output.len()
            )));
        }
        if input.is_empty() {
            return Err(Error::invalid_argument("process_buffer needs at least one byte"));
        }
        let size = u32::try_from(input.len())
            .map_err(|_| Error::invalid_argument(format!("{} bytes exceeds the kernel's u32 size", input.len())))?;

        let queue = self.queue()?;
        let kernel = self
            .kernel("process_buffer")
            .ok_or_else(|| Error::invalid_argument("context has no process_buffer kernel"))?;

        let started = Instant::now();
        let device = &*self.device;

        let in_buf = device.alloc_and_init_read_buffer(queue, input)?;
        let out_buf = device.alloc_write_buffer(output.len())?;

        device.set_kernel_args(
            kernel,
            &[KernelArg::buffer(&in_buf), KernelArg::buffer(&out_buf), KernelArg::scalar(&size)],
        )?;
        device.run_2d(queue, kernel, input.len(), 1, None)?;
        device.flush(queue)?;
        device.read_from_buffer(queue, &out_buf, output)?;

        device.metrics().record_latency(started.elapsed());
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        for (_, kernel) in self.kernels.drain(..) {
            self.device.destroy_kernel(kernel);
        }
        if let Some(queue) = self.queue.take() {
            self.device.destroy_command_queue(queue);
        }
        self.device.context_closed();
    }
}

pub fn create_context(device: &Arc<Device>) -> Result<ExecutionContext> {
    ExecutionContext::create(device)
}

/// Release a context. `None` is accepted and ignored.
pub fn destroy_context(context: Option<ExecutionContext>) {
    drop(context);
}

#[cfg(all(test, not(feature = "strict")))]
mod tests {
    use super::*;
    use crate::backend::kernels::KERNEL_SOURCE;
    use crate::backend::{HostBackend, HostCall, Status};

    fn device_on(backend: &Arc<HostBackend>, program: bool) -> Arc<Device> {
        let device = Arc::new(Device::new(backend.clone()));
        device.init(false).unwrap();
        if program {
            device.init_program(KERNEL_SOURCE.as_bytes()).unwrap();
        }
        device
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn test_context_is_send() {
        assert_send::<ExecutionContext>();
    }

    #[test]
    fn test_requires_initialized_device() {
        let backend = Arc::new(HostBackend::default());
        let device = Arc::new(Device::new(backend.clone()));

        assert!(matches!(create_context(&device), Err(Error::NotInitialized)));
        assert_eq!(device.live_contexts(), 0);
    }

    #[test]
    fn test_requires_program_before_backend_calls() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, false);

        assert!(matches!(create_context(&device), Err(Error::ProgramNotLoaded)));
        assert_eq!(backend.call_count(HostCall::CreateQueue), 1);
        assert_eq!(backend.call_count(HostCall::CreateKernel), 0);
        assert_eq!(device.live_contexts(), 0);
    }

    #[test]
    fn test_kernel_failure_rolls_back_queue() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);

        backend.fail_next(HostCall::CreateKernel, Status::OUT_OF_RESOURCES);
        let err = create_context(&device).unwrap_err();
        assert!(matches!(err, Error::ResourceCreation { resource: "kernel", .. }));

        let live = backend.live_objects();
        assert_eq!(live.queues, 1);
        assert_eq!(live.kernels, 0);
        assert_eq!(device.live_contexts(), 0);
    }

    #[test]
    fn test_queue_failure() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);

        backend.fail_next(HostCall::CreateQueue, Status::OUT_OF_HOST_MEMORY);
        assert!(matches!(create_context(&device), Err(Error::QueueCreationFailed(_))));
        assert_eq!(backend.live_objects().queues, 1);
        assert_eq!(device.live_contexts(), 0);
    }

    #[test]
    fn test_process_buffer() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);
        let mut context = create_context(&device).unwrap();
        assert_eq!(device.live_contexts(), 1);

        let input: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut output = vec![0u8; input.len()];
        context.process_buffer(&input, &mut output).unwrap();

        for i in 0..input.len() {
            assert_eq!(output[i], input[i] ^ (i % 256) as u8, "mismatch at {}", i);
        }
        assert_eq!(backend.live_objects().mems, 0);

        let snapshot = device.metrics().snapshot();
        assert_eq!(snapshot.operations, 1);
        assert_eq!(snapshot.bytes_uploaded, 1000);
        assert_eq!(snapshot.bytes_downloaded, 1000);

        destroy_context(Some(context));
        assert_eq!(device.live_contexts(), 0);
        assert_eq!(backend.live_objects().kernels, 0);
        assert_eq!(backend.live_objects().queues, 1);
    }

    #[test]
    fn test_process_buffer_argument_checks() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);
        let mut context = create_context(&device).unwrap();

        let mut out = [0u8; 4];
        assert!(matches!(
            context.process_buffer(&[1, 2, 3], &mut out),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(context.process_buffer(&[], &mut []), Err(Error::InvalidArgument(_))));
        assert_eq!(backend.call_count(HostCall::CreateBuffer), 0);
    }

    #[test]
    fn test_failures_release_both_buffers() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);
        let mut context = create_context(&device).unwrap();
        let input = [7u8; 32];
        let mut output = [0u8; 32];

        for call in [
            HostCall::CreateBuffer,
            HostCall::SetKernelArg,
            HostCall::EnqueueKernel,
            HostCall::Finish,
            HostCall::ReadBuffer,
        ] {
            backend.fail_next(call, Status::OUT_OF_RESOURCES);
            assert!(context.process_buffer(&input, &mut output).is_err(), "{:?} should fail", call);
            assert_eq!(backend.live_objects().mems, 0, "leak after {:?}", call);
        }

        // Output allocation is the second buffer.
        backend.fail_nth(HostCall::CreateBuffer, 2, Status::MEM_OBJECT_ALLOCATION_FAILURE);
        assert!(context.process_buffer(&input, &mut output).is_err());
        assert_eq!(backend.live_objects().mems, 0);

        context.process_buffer(&input, &mut output).unwrap();
        assert_eq!(output[1], 7 ^ 1);
    }

    #[test]
    fn test_contexts_are_independent() {
        let backend = Arc::new(HostBackend::default());
        let device = device_on(&backend, true);

        let first = create_context(&device).unwrap();
        let mut second = create_context(&device).unwrap();
        assert_ne!(first.queue().unwrap(), second.queue().unwrap());
        assert_ne!(first.kernel("process_buffer"), second.kernel("process_buffer"));

        destroy_context(Some(first));
        let mut out = [0u8; 3];
        second.process_buffer(&[0, 0, 0], &mut out).unwrap();
        assert_eq!(out, [0, 1, 2]);

        destroy_context(None);
    }
}
