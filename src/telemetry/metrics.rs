//! Resource and dispatch counters for one device.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Object classes the device allocates on behalf of its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Queue,
    Kernel,
    Buffer,
    Image,
    Program,
}

#[derive(Debug, Default)]
struct Pair {
    created: AtomicU64,
    released: AtomicU64,
}

impl Pair {
    fn load(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }
}

/// Device metrics collector
#[derive(Debug)]
pub struct DeviceMetrics {
    queues: Pair,
    kernels: Pair,
    buffers: Pair,
    images: Pair,
    programs: Pair,

    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    dispatches: AtomicU64,
    backend_failures: AtomicU64,
    operations: AtomicU64,

    // Wall time of whole process_buffer style operations
    latency_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        // 3 significant figures, max value of 1 hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("Failed to create histogram");

        Self {
            queues: Pair::default(),
            kernels: Pair::default(),
            buffers: Pair::default(),
            images: Pair::default(),
            programs: Pair::default(),
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    fn pair(&self, resource: Resource) -> &Pair {
        match resource {
            Resource::Queue => &self.queues,
            Resource::Kernel => &self.kernels,
            Resource::Buffer => &self.buffers,
            Resource::Image => &self.images,
            Resource::Program => &self.programs,
        }
    }

    pub fn record_created(&self, resource: Resource) {
        self.pair(resource).created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, resource: Resource) {
        self.pair(resource).released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: usize) {
        self.bytes_uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one operation and add its wall time to the histogram. Samples
    /// above the histogram's range are clamped to its maximum.
    pub fn record_latency(&self, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.latency_histogram.write().saturating_record(nanos);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            queues: self.queues.load(),
            kernels: self.kernels.load(),
            buffers: self.buffers.load(),
            images: self.images.load(),
            programs: self.programs.load(),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            avg_latency_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_latency_ns: histogram.value_at_quantile(0.50),
            p99_latency_ns: histogram.value_at_quantile(0.99),
            max_latency_ns: histogram.max(),
        }
    }
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`DeviceMetrics`]. Resource fields are `(created, released)`.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub queues: (u64, u64),
    pub kernels: (u64, u64),
    pub buffers: (u64, u64),
    pub images: (u64, u64),
    pub programs: (u64, u64),
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub dispatches: u64,
    pub backend_failures: u64,
    pub operations: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

fn live((created, released): (u64, u64)) -> u64 {
    created.saturating_sub(released)
}

impl MetricsSnapshot {
    pub fn live_queues(&self) -> u64 {
        live(self.queues)
    }

    pub fn live_kernels(&self) -> u64 {
        live(self.kernels)
    }

    pub fn live_buffers(&self) -> u64 {
        live(self.buffers)
    }

    pub fn live_images(&self) -> u64 {
        live(self.images)
    }

    pub fn live_programs(&self) -> u64 {
        live(self.programs)
    }

    /// True when every object created through the device has been released.
    pub fn is_balanced(&self) -> bool {
        [self.queues, self.kernels, self.buffers, self.images, self.programs]
            .iter()
            .all(|(c, r)| c == r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_balance() {
        let metrics = DeviceMetrics::new();

        metrics.record_created(Resource::Buffer);
        metrics.record_created(Resource::Buffer);
        metrics.record_created(Resource::Queue);
        metrics.record_released(Resource::Buffer);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.live_buffers(), 1);
        assert_eq!(snapshot.live_queues(), 1);
        assert!(!snapshot.is_balanced());

        metrics.record_released(Resource::Buffer);
        metrics.record_released(Resource::Queue);
        assert!(metrics.snapshot().is_balanced());
    }

    #[test]
    fn test_latency_recording() {
        let metrics = DeviceMetrics::new();

        for i in 1..=100 {
            metrics.record_latency(Duration::from_micros(i));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations, 100);
        assert!(snapshot.avg_latency_ns > 0);
        assert!(snapshot.p99_latency_ns >= snapshot.p50_latency_ns);
    }

    #[test]
    fn test_concurrent_latency_samples_are_all_counted() {
        let metrics = std::sync::Arc::new(DeviceMetrics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 1..=250 {
                        metrics.record_latency(Duration::from_nanos(i));
                        if i % 50 == 0 {
                            let _ = metrics.snapshot();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        metrics.record_latency(Duration::from_secs(2 * 3600));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations, 8 * 250 + 1);
        assert!(snapshot.max_latency_ns >= 3_600_000_000_000 - 3_600_000_000);
    }
}
