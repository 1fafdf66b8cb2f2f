use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples with percentile queries
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    samples: Arc<Mutex<VecDeque<u64>>>,
    window: usize,
}

impl PercentileTracker {
    /// Keep at most `window` most recent samples
    pub fn new(window: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window))),
            window,
        }
    }

    /// Record one sample
    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_nanos() as u64);
    }

    /// Percentile `p` (0.0-1.0) in microseconds, 0 when empty
    pub fn percentile_us(&self, p: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Counters shared by a stage's workers, multiplexer and the scheduler
#[derive(Debug, Clone)]
pub struct StageMetrics {
    processed: Arc<AtomicU64>,
    forwarded: Arc<AtomicU64>,
    workers_added: Arc<AtomicU64>,
    workers_removed: Arc<AtomicU64>,
    reorder_peak: Arc<AtomicUsize>,
    latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            forwarded: Arc::new(AtomicU64::new(0)),
            workers_added: Arc::new(AtomicU64::new(0)),
            workers_removed: Arc::new(AtomicU64::new(0)),
            reorder_peak: Arc::new(AtomicUsize::new(0)),
            latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    /// A worker finished transforming one input item
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    /// The multiplexer released one payload downstream
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_added(&self) {
        self.workers_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_removed(&self) {
        self.workers_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the largest number of items held back for reordering
    pub fn record_reorder_depth(&self, depth: usize) {
        self.reorder_peak.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn workers_added(&self) -> u64 {
        self.workers_added.load(Ordering::Relaxed)
    }

    pub fn workers_removed(&self) -> u64 {
        self.workers_removed.load(Ordering::Relaxed)
    }

    pub fn reorder_peak(&self) -> usize {
        self.reorder_peak.load(Ordering::Relaxed)
    }

    /// Input items processed per second since creation
    pub fn throughput_ips(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.total_processed(),
            forwarded: self.total_forwarded(),
            workers_added: self.workers_added(),
            workers_removed: self.workers_removed(),
            reorder_peak: self.reorder_peak(),
            throughput_ips: self.throughput_ips(),
            latency_p50_us: self.latency.percentile_us(0.50),
            latency_p95_us: self.latency.percentile_us(0.95),
            latency_p99_us: self.latency.percentile_us(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of stage metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub forwarded: u64,
    pub workers_added: u64,
    pub workers_removed: u64,
    pub reorder_peak: usize,
    pub throughput_ips: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn format(&self) -> String {
        format!(
            "Processed: {}, Forwarded: {}, Workers +{}/-{}, Reorder peak: {}, \
             Throughput: {:.2} items/s, Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, \
             Elapsed: {:.2}s",
            self.processed,
            self.forwarded,
            self.workers_added,
            self.workers_removed,
            self.reorder_peak,
            self.throughput_ips,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
