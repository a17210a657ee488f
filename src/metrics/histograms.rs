//! Latency histograms for drains and splits.

use super::Descriptor;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket upper bounds in seconds. A drain of a few entries lands in the
/// low buckets, a split copying a large partition in the high ones.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Cumulative-bucket histogram of durations in seconds.
#[derive(Debug)]
pub struct Histogram {
    desc: Descriptor,
    bounds: &'static [f64],
    // Non-cumulative per bucket; the last slot counts values above every bound.
    hits: Vec<AtomicU64>,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            bounds: DEFAULT_BUCKETS,
            hits: (0..=DEFAULT_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn help(&self) -> &'static str {
        self.desc.help
    }

    pub fn observe(&self, seconds: f64) {
        let slot = self.bounds.partition_point(|upper| *upper < seconds);
        self.hits[slot].fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + seconds).to_bits())
            });
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut running = 0;
        let mut counts = Vec::with_capacity(self.bounds.len());
        for hits in &self.hits[..self.bounds.len()] {
            running += hits.load(Ordering::Relaxed);
            counts.push(running);
        }
        let overflow = self.hits[self.bounds.len()].load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.bounds.to_vec(),
            counts,
            sum: f64::from_bits(self.sum_bits.load(Ordering::Relaxed)),
            count: running + overflow,
        }
    }

    pub(super) fn render(&self, out: &mut String) {
        let snap = self.snapshot();
        let name = self.desc.name;
        self.desc.header(out, "histogram");
        for (upper, count) in snap.buckets.iter().zip(&snap.counts) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{upper}\"}} {count}");
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", snap.count);
        let _ = writeln!(out, "{name}_sum {}", snap.sum);
        let _ = writeln!(out, "{name}_count {}", snap.count);
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, Default)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds in seconds.
    pub buckets: Vec<f64>,
    /// Observations at or below each bound.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    /// Mean in seconds, 0 when nothing was observed.
    pub fn mean(&self) -> f64 {
        match self.count {
            0 => 0.0,
            n => self.sum / n as f64,
        }
    }
}
