//! Runs the reference `process_buffer` kernel from several threads and
//! checks every output byte.
//!
//! ```text
//! cargo run --example process_buffer -- --threads 4 --force-serialize
//! ```

use clap::Parser;
use clkit::prelude::*;
use rand::Rng;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "process_buffer", about = "Exercise clkit execution contexts")]
struct Args {
    /// Serialize all backend calls regardless of the detected driver
    #[arg(long)]
    force_serialize: bool,

    /// Load kernels from this file instead of the built-in source
    #[arg(long)]
    kernel_path: Option<PathBuf>,

    /// Worker threads, each with its own execution context
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Bytes per buffer
    #[arg(long, default_value_t = 8192)]
    size: usize,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One worker: own context, random input, full validation.
fn run_worker(id: usize, size: usize) -> Result<usize> {
    let mut ctx = clkit::create_context()?;

    let mut input = vec![0u8; size];
    rand::thread_rng().fill(&mut input[..]);
    let mut output = vec![0u8; size];

    ctx.process_buffer(&input, &mut output)?;

    if id == 0 {
        for (i, (a, b)) in input.iter().zip(&output).take(16).enumerate() {
            println!("{:4}: {:3} -> {:3}", i, a, b);
        }
    }

    let mismatches = input
        .iter()
        .zip(&output)
        .enumerate()
        .filter(|&(i, (&a, &b))| b != a ^ i as u8)
        .count();

    destroy_context(Some(ctx));
    Ok(mismatches)
}

fn run(args: &Args) -> Result<bool> {
    let mut config = DeviceConfig::from_env()?;
    config.force_serialize |= args.force_serialize;
    if let Some(path) = &args.kernel_path {
        config.kernel_source = KernelSource::File(path.clone());
    }

    clkit::init(config)?;
    if let Some(info) = clkit::device().and_then(|d| d.info()) {
        println!(
            "device: {} ({}) on {} [{}], serialized: {}",
            info.device_name, info.device_type, info.platform_name, info.platform_version, info.serialized
        );
    }

    let size = args.size;
    let handles: Vec<_> = (0..args.threads.max(1))
        .map(|id| thread::spawn(move || run_worker(id, size)))
        .collect();

    let mut ok = true;
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(0)) => {}
            Ok(Ok(bad)) => {
                eprintln!("thread {}: {} of {} bytes wrong", id, bad, size);
                ok = false;
            }
            Ok(Err(e)) => {
                eprintln!("thread {}: {}", id, e);
                ok = false;
            }
            Err(_) => {
                eprintln!("thread {} panicked", id);
                ok = false;
            }
        }
    }

    if let Some(device) = clkit::device() {
        let snapshot = device.metrics().snapshot();
        println!(
            "dispatches: {}, p50: {} us, p99: {} us",
            snapshot.dispatches,
            snapshot.p50_latency_ns / 1000,
            snapshot.p99_latency_ns / 1000
        );
    }

    clkit::shutdown();
    Ok(ok)
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.verbose);

    match run(&args) {
        Ok(true) => {
            println!("ok");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            clkit::shutdown();
            ExitCode::FAILURE
        }
    }
}
