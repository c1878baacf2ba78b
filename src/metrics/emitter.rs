use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-bucket histogram: counters only, safe to hammer from any thread.
pub struct Histogram {
    bounds: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    total: AtomicU64,
}

impl Histogram {
    /// `bounds` are inclusive upper edges; one overflow bucket is appended.
    pub fn new(bounds: Vec<u64>) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Histogram {
            bounds,
            counts,
            sum: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .bounds
                .iter()
                .copied()
                .zip(self.counts.iter().map(|c| c.load(Ordering::Relaxed)))
                .collect(),
            overflow: self.counts[self.bounds.len()].load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            count: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// (inclusive upper edge, count) pairs.
    pub buckets: Vec<(u64, u64)>,
    pub overflow: u64,
    pub sum: u64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Service-level counters and histograms. Purely additive; nothing here
/// sits on a query's critical path beyond an atomic increment.
pub struct Metrics {
    pub queries: AtomicU64,
    pub flush_failures: AtomicU64,
    pub dead_letters: AtomicU64,
    pub rebuilds: AtomicU64,
    pub last_rebuild_ms: AtomicU64,

    pub query_latency_us: Histogram,
    pub flush_batch_size: Histogram,
    pub topk_recompute_depth: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            queries: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            last_rebuild_ms: AtomicU64::new(0),
            query_latency_us: Histogram::new(vec![100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000]),
            flush_batch_size: Histogram::new(vec![1, 10, 50, 100, 250, 500]),
            topk_recompute_depth: Histogram::new(vec![1, 2, 4, 8, 16, 32, 80]),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            last_rebuild_ms: self.last_rebuild_ms.load(Ordering::Relaxed),
            query_latency_us: self.query_latency_us.snapshot(),
            flush_batch_size: self.flush_batch_size.snapshot(),
            topk_recompute_depth: self.topk_recompute_depth.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub flush_failures: u64,
    pub dead_letters: u64,
    pub rebuilds: u64,
    pub last_rebuild_ms: u64,
    pub query_latency_us: HistogramSnapshot,
    pub flush_batch_size: HistogramSnapshot,
    pub topk_recompute_depth: HistogramSnapshot,
}
