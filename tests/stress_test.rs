//! Stress tests for concurrent execution contexts

use clkit::backend::kernels::KERNEL_SOURCE;
use clkit::prelude::*;
use std::sync::{Arc, Barrier};
use std::thread;

const SIZE: usize = 8192;

fn ready_device(backend: &Arc<HostBackend>, force_serialize: bool) -> Arc<Device> {
    let device = Arc::new(Device::new(backend.clone()));
    device.init(force_serialize).unwrap();
    device.init_program(KERNEL_SOURCE.as_bytes()).unwrap();
    device
}

fn run_workers(device: &Arc<Device>, threads: usize, rounds: usize) {
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let device = device.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut ctx = ExecutionContext::create(&device).unwrap();
                let input: Vec<u8> = (0..SIZE).map(|i| (i % 256) as u8).collect();
                let mut output = vec![0xFFu8; SIZE];

                barrier.wait();
                for _ in 0..rounds {
                    ctx.process_buffer(&input, &mut output).unwrap();
                    assert!(output.iter().all(|&b| b == 0));
                }
                destroy_context(Some(ctx));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_forced_gate_serializes_two_threads() {
    let backend = Arc::new(HostBackend::default());
    let device = ready_device(&backend, true);
    assert!(device.is_serialized());
    backend.reset_peak_concurrency();

    run_workers(&device, 2, 4);

    assert_eq!(backend.peak_concurrency(), 1);
    assert!(device.gate().acquisitions() > 0);
    assert_eq!(device.live_contexts(), 0);
}

#[test]
fn test_ungated_threads_stay_correct() {
    let backend = Arc::new(HostBackend::default());
    let device = ready_device(&backend, false);
    assert!(!device.is_serialized());

    run_workers(&device, 4, 4);

    assert_eq!(device.gate().acquisitions(), 0);
    device.deinit();
    assert!(backend.live_objects().is_empty());
    assert!(device.metrics().snapshot().is_balanced());
}

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_threads_many_rounds() {
    let backend = Arc::new(HostBackend::default());
    let device = ready_device(&backend, false);

    run_workers(&device, 16, 200);

    let snapshot = device.metrics().snapshot();
    assert_eq!(snapshot.dispatches, 16 * 200);
    assert_eq!(snapshot.live_buffers(), 0);
}

#[test]
#[ignore]
fn stress_test_context_churn() {
    let backend = Arc::new(HostBackend::default());
    let device = ready_device(&backend, true);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let device = device.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let ctx = ExecutionContext::create(&device).unwrap();
                    destroy_context(Some(ctx));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(backend.peak_concurrency(), 1);
    assert_eq!(backend.live_objects().kernels, 0);
    assert_eq!(backend.live_objects().queues, 1);
}
