//! Benchmarks for process_buffer and the serialization gate

use clkit::backend::kernels::KERNEL_SOURCE;
use clkit::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

fn ready_device(force_serialize: bool) -> Arc<Device> {
    let device = Arc::new(Device::new(Arc::new(HostBackend::default())));
    device.init(force_serialize).unwrap();
    device.init_program(KERNEL_SOURCE.as_bytes()).unwrap();
    device
}

fn bench_process_buffer_sizes(c: &mut Criterion) {
    let device = ready_device(false);
    let mut ctx = ExecutionContext::create(&device).unwrap();

    let mut group = c.benchmark_group("process_buffer");
    for size in [256usize, 8192, 1 << 20] {
        let input: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let mut output = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                ctx.process_buffer(black_box(input), &mut output).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_gate_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate");

    for serialized in [false, true] {
        let device = ready_device(serialized);
        let label = if serialized { "serialized" } else { "concurrent" };

        group.bench_function(BenchmarkId::new("4_threads", label), |b| {
            b.iter(|| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let device = device.clone();
                        thread::spawn(move || {
                            let mut ctx = ExecutionContext::create(&device).unwrap();
                            let input = vec![7u8; 8192];
                            let mut output = vec![0u8; 8192];
                            ctx.process_buffer(&input, &mut output).unwrap();
                            black_box(output[8191])
                        })
                    })
                    .collect();

                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_process_buffer_sizes, bench_gate_overhead);
criterion_main!(benches);
