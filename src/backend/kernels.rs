//! Kernels the host backend can execute natively, and the OpenCL C source
//! they correspond to.

use super::{NdRange, Status};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// OpenCL C source of every kernel in [`builtin_kernels`].
pub const KERNEL_SOURCE: &str = include_str!("../../kernels/process_buffer.cl");

/// Storage of one host memory object.
pub type HostMemory = Arc<Mutex<Vec<u8>>>;

/// Declared kind of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// `__global` pointer or image.
    Mem,
    /// By-value argument of the given byte size.
    Scalar(usize),
}

/// An argument after the host backend has resolved handles to storage.
#[derive(Debug, Clone)]
pub enum BoundArg {
    Mem(HostMemory),
    Bytes(Vec<u8>),
}

/// Positional view over the arguments of one launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    args: &'a [BoundArg],
}

impl<'a> KernelArgs<'a> {
    pub fn new(args: &'a [BoundArg]) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn mem(&self, index: usize) -> Result<&HostMemory, Status> {
        match self.args.get(index) {
            Some(BoundArg::Mem(mem)) => Ok(mem),
            Some(BoundArg::Bytes(_)) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_KERNEL_ARGS),
        }
    }

    /// Copy of a memory argument's contents.
    pub fn read_mem(&self, index: usize) -> Result<Vec<u8>, Status> {
        Ok(self.mem(index)?.lock().clone())
    }

    pub fn with_mem_mut<R>(&self, index: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Status> {
        let mem = self.mem(index)?;
        let mut guard = mem.lock();
        Ok(f(&mut guard))
    }

    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> Result<T, Status> {
        match self.args.get(index) {
            Some(BoundArg::Bytes(bytes)) => {
                bytemuck::try_pod_read_unaligned(bytes).map_err(|_| Status::INVALID_ARG_SIZE)
            }
            Some(BoundArg::Mem(_)) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_KERNEL_ARGS),
        }
    }
}

/// A kernel entry point implemented in Rust.
pub trait NativeKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn params(&self) -> &'static [Param];

    /// Execute every work-item of `range`. Errors are reported as the status
    /// the launch would have failed with.
    fn run(&self, args: &KernelArgs<'_>, range: &NdRange) -> Result<(), Status>;
}

impl fmt::Debug for dyn NativeKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeKernel").field("name", &self.name()).finish()
    }
}

/// `process_buffer(const uchar *input, uchar *output, uint size)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBuffer;

impl NativeKernel for ProcessBuffer {
    fn name(&self) -> &'static str {
        "process_buffer"
    }

    fn params(&self) -> &'static [Param] {
        &[Param::Mem, Param::Mem, Param::Scalar(4)]
    }

    fn run(&self, args: &KernelArgs<'_>, range: &NdRange) -> Result<(), Status> {
        let input = args.read_mem(0)?;
        let size = args.scalar::<u32>(2)? as usize;

        args.with_mem_mut(1, |output| {
            for _row in 0..range.global[1] {
                for x in 0..range.global[0] {
                    let i = range.offset[0] + x;
                    if i >= size || i >= input.len() || i >= output.len() {
                        continue;
                    }
                    output[i] = input[i] ^ (i as u8);
                }
            }
        })
    }
}

pub fn builtin_kernels() -> Vec<Arc<dyn NativeKernel>> {
    vec![Arc::new(ProcessBuffer)]
}

/// Entry points declared in OpenCL C source, in declaration order.
///
/// Recognizes `__kernel void name(` and `kernel void name(`, skipping `//`
/// line comments.
pub fn declared_entry_points(source: &str) -> Vec<String> {
    let mut names = Vec::new();

    for line in source.lines() {
        let code = match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        };

        let mut tokens = code
            .split(|c: char| c.is_whitespace() || c == '(')
            .filter(|t| !t.is_empty());

        while let Some(token) = tokens.next() {
            if token != "__kernel" && token != "kernel" {
                continue;
            }
            if tokens.next() != Some("void") {
                break;
            }
            if let Some(name) = tokens.next() {
                names.push(name.to_string());
            }
            break;
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_entry_points() {
        assert_eq!(declared_entry_points(KERNEL_SOURCE), vec!["process_buffer"]);

        let src = "kernel void a(global int *x) {}\n// __kernel void hidden(\n__kernel void b (int y) {}";
        assert_eq!(declared_entry_points(src), vec!["a", "b"]);
        assert!(declared_entry_points("int helper(int x) { return x; }").is_empty());
    }

    #[test]
    fn test_process_buffer_native() {
        let input: HostMemory = Arc::new(Mutex::new((0..=255u8).collect()));
        let output: HostMemory = Arc::new(Mutex::new(vec![0u8; 256]));
        let args = vec![
            BoundArg::Mem(input),
            BoundArg::Mem(output.clone()),
            BoundArg::Bytes(256u32.to_ne_bytes().to_vec()),
        ];

        ProcessBuffer
            .run(&KernelArgs::new(&args), &NdRange::two(256, 1, None))
            .unwrap();

        assert!(output.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scalar_size_mismatch() {
        let args = vec![BoundArg::Bytes(vec![1, 2])];
        let view = KernelArgs::new(&args);
        assert_eq!(view.scalar::<u32>(0), Err(Status::INVALID_ARG_SIZE));
        assert_eq!(view.scalar::<u32>(1), Err(Status::INVALID_KERNEL_ARGS));
    }
}
