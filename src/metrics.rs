//! Shared metrics collection infrastructure
//!
//! Size-bucketed HDR histograms for detailed latency analysis, one set per
//! operation kind.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::record::OpKind;

/// Number of size buckets for histogram collection
pub const NUM_BUCKETS: usize = 9;

/// Labels for each size bucket
pub const BUCKET_LABELS: [&str; NUM_BUCKETS] = [
    "zero",
    "1B-8KiB",
    "8KiB-64KiB",
    "64KiB-512KiB",
    "512KiB-4MiB",
    "4MiB-32MiB",
    "32MiB-256MiB",
    "256MiB-2GiB",
    ">2GiB",
];

/// Highest trackable latency: one hour in microseconds
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Determine which size bucket a given byte count belongs to
pub fn bucket_index(nbytes: u64) -> usize {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    match nbytes {
        0 => 0,
        n if n <= 8 * KIB => 1,
        n if n <= 64 * KIB => 2,
        n if n <= 512 * KIB => 3,
        n if n <= 4 * MIB => 4,
        n if n <= 32 * MIB => 5,
        n if n <= 256 * MIB => 6,
        n if n <= 2048 * MIB => 7,
        _ => 8,
    }
}

fn new_histogram() -> Histogram<u64> {
    // Fixed, valid bounds; allocation cannot fail
    Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3).expect("failed to allocate histogram")
}

/// Latency summary of one histogram, in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl LatencySummary {
    pub fn from_histogram(hist: &Histogram<u64>) -> Option<Self> {
        if hist.is_empty() {
            return None;
        }
        Some(Self {
            count: hist.len(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            max: hist.max(),
        })
    }
}

/// Size-bucketed histograms for one operation type
#[derive(Debug, Clone)]
pub struct OpHists {
    pub buckets: Arc<Vec<Mutex<Histogram<u64>>>>,
}

impl OpHists {
    /// Create a new set of histograms (one per size bucket)
    pub fn new() -> Self {
        let v = (0..NUM_BUCKETS).map(|_| Mutex::new(new_histogram())).collect();
        OpHists {
            buckets: Arc::new(v),
        }
    }

    /// Record a latency measurement in the appropriate size bucket
    pub fn record(&self, bucket: usize, duration: Duration) {
        let micros = (duration.as_micros() as u64).clamp(1, MAX_LATENCY_US);
        let _ = self.buckets[bucket].lock().record(micros);
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Per-bucket summaries, skipping empty buckets
    pub fn bucket_summaries(&self) -> Vec<(usize, LatencySummary)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, m)| LatencySummary::from_histogram(&m.lock()).map(|s| (i, s)))
            .collect()
    }

    /// Print a summary of all buckets for this operation
    pub fn print_summary(&self, op: &str) {
        println!("\n{} latency (µs):", op);
        for (i, s) in self.bucket_summaries() {
            println!(
                "  [{:>13}] count={:<8} mean={:<8.0} p50={:<8} p95={:<8} p99={:<8} max={:<8}",
                BUCKET_LABELS[i], s.count, s.mean, s.p50, s.p95, s.p99, s.max
            );
        }
    }

    /// Get a combined histogram across all size buckets (for aggregated percentiles)
    pub fn combined_histogram(&self) -> Histogram<u64> {
        let mut combined = new_histogram();
        for bucket_hist in self.buckets.iter() {
            combined.add(&*bucket_hist.lock()).ok();
        }
        combined
    }
}

impl Default for OpHists {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`OpHists`] per operation kind
#[derive(Debug, Clone)]
pub struct KindHists {
    kinds: Arc<Vec<OpHists>>,
}

impl KindHists {
    pub fn new() -> Self {
        Self {
            kinds: Arc::new((0..OpKind::COUNT).map(|_| OpHists::new()).collect()),
        }
    }

    pub fn record(&self, kind: OpKind, nbytes: u64, duration: Duration) {
        self.kinds[kind.index()].record(bucket_index(nbytes), duration);
    }

    pub fn get(&self, kind: OpKind) -> &OpHists {
        &self.kinds[kind.index()]
    }

    /// Kinds with at least one sample, in declaration order
    pub fn active(&self) -> impl Iterator<Item = (OpKind, &OpHists)> + '_ {
        OpKind::ALL
            .iter()
            .map(move |&k| (k, self.get(k)))
            .filter(|(_, h)| h.count() > 0)
    }

    /// All samples across every kind and bucket
    pub fn combined_histogram(&self) -> Histogram<u64> {
        let mut combined = new_histogram();
        for h in self.kinds.iter() {
            combined.add(&h.combined_histogram()).ok();
        }
        combined
    }

    pub fn print_summary(&self) {
        for (kind, hists) in self.active() {
            hists.print_summary(kind.as_str());
        }
    }
}

impl Default for KindHists {
    fn default() -> Self {
        Self::new()
    }
}
