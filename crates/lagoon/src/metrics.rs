//! Pool statistics: counters, gauges and latency histograms.
//!
//! Wait time (submission to dispatch) and run time (dispatch to completion)
//! are recorded in microseconds into HDR histograms; the facade exposes
//! them as percentile-enriched summaries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Highest latency the histograms can record: one hour, in microseconds.
const MAX_RECORDABLE_MICROS: u64 = 3_600_000_000;

/// Shared pool statistics, written by the controller and read anywhere.
pub(crate) struct PoolStats {
    started_at: Instant,
    completed: AtomicU64,
    queue_len: AtomicUsize,
    pending_workers: AtomicUsize,
    live_workers: AtomicUsize,
    wait_time: Mutex<Histogram<u64>>,
    run_time: Mutex<Histogram<u64>>,
}

impl PoolStats {
    pub fn new() -> Self {
        let histogram = || {
            Histogram::<u64>::new_with_bounds(1, MAX_RECORDABLE_MICROS, 3)
                .expect("histogram bounds are valid")
        };
        Self {
            started_at: Instant::now(),
            completed: AtomicU64::new(0),
            queue_len: AtomicUsize::new(0),
            pending_workers: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            wait_time: Mutex::new(histogram()),
            run_time: Mutex::new(histogram()),
        }
    }

    pub fn record_wait(&self, elapsed: Duration) {
        self.wait_time
            .lock()
            .saturating_record(elapsed.as_micros() as u64);
    }

    pub fn record_run(&self, elapsed: Duration) {
        self.run_time
            .lock()
            .saturating_record(elapsed.as_micros() as u64);
    }

    pub fn incr_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Release);
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    pub fn set_pending_workers(&self, count: usize) {
        self.pending_workers.store(count, Ordering::Release);
    }

    pub fn pending_workers(&self) -> usize {
        self.pending_workers.load(Ordering::Acquire)
    }

    pub fn set_live_workers(&self, count: usize) {
        self.live_workers.store(count, Ordering::Release);
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn wait_summary(&self) -> HistogramSummary {
        HistogramSummary::from_histogram(&self.wait_time.lock())
    }

    pub fn run_summary(&self) -> HistogramSummary {
        HistogramSummary::from_histogram(&self.run_time.lock())
    }

    /// Fraction of the pool's capacity spent running tasks since start.
    pub fn utilization(&self, max_threads: usize) -> f64 {
        let run_time = self.run_time.lock();
        let duration_micros = self.started_at.elapsed().as_micros() as f64;
        if duration_micros <= 0.0 || max_threads == 0 {
            return 0.0;
        }
        (run_time.mean() * run_time.len() as f64) / (duration_micros * max_threads as f64)
    }
}

/// Percentile-enriched snapshot of a latency histogram, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    /// Number of recorded samples.
    pub count: u64,
    /// Lowest recorded value.
    pub min: u64,
    /// Highest recorded value.
    pub max: u64,
    /// Mean of the recorded values.
    pub mean: f64,
    /// 50th percentile.
    pub p50: u64,
    /// 75th percentile.
    pub p75: u64,
    /// 90th percentile.
    pub p90: u64,
    /// 99th percentile.
    pub p99: u64,
}

impl HistogramSummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self {
                count: 0,
                min: 0,
                max: 0,
                mean: 0.0,
                p50: 0,
                p75: 0,
                p90: 0,
                p99: 0,
            };
        }
        Self {
            count: histogram.len(),
            min: histogram.min(),
            max: histogram.max(),
            mean: histogram.mean(),
            p50: histogram.value_at_quantile(0.50),
            p75: histogram.value_at_quantile(0.75),
            p90: histogram.value_at_quantile(0.90),
            p99: histogram.value_at_quantile(0.99),
        }
    }
}

/// Point-in-time view of the pool's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetrics {
    /// Tasks queued beyond what warming workers will absorb.
    pub queue_size: usize,
    /// Tasks completed since the pool started.
    pub completed: u64,
    /// Time since the pool started.
    pub duration: Duration,
    /// Submission-to-dispatch latency.
    pub wait_time: HistogramSummary,
    /// Dispatch-to-completion latency.
    pub run_time: HistogramSummary,
    /// Fraction of capacity spent running tasks.
    pub utilization: f64,
    /// Live worker threads, pending and ready.
    pub threads: usize,
}
