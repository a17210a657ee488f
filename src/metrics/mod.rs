//! Metrics for monitoring the router.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        RouterMetrics                          │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌────────────────┐ │
//! │  │   Counters     │  │     Gauges      │  │   Histograms   │ │
//! │  │ - submitted    │  │ - active drains │  │ - drain time   │ │
//! │  │ - persisted    │  │   (with peak)   │  │ - split time   │ │
//! │  │ - dead letters │  │                 │  │                │ │
//! │  │ - promotions   │  │                 │  │                │ │
//! │  └────────────────┘  └─────────────────┘  └────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::{Gauge, GaugeGuard};
pub use histograms::{Histogram, HistogramSnapshot, DEFAULT_BUCKETS};

use std::fmt::Write;

/// Name and help text shared by every metric kind.
#[derive(Debug, Clone, Copy)]
struct Descriptor {
    name: &'static str,
    help: &'static str,
}

impl Descriptor {
    fn header(&self, out: &mut String, kind: &str) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, kind);
    }
}

/// Metrics shared by every component of one router.
#[derive(Debug)]
pub struct RouterMetrics {
    /// Writes accepted by `submit_write`.
    pub writes_submitted: Counter,
    /// Queue entries persisted to their primary.
    pub writes_persisted: Counter,
    /// Insert attempts that failed and were scheduled for retry.
    pub write_retries: Counter,
    /// Entries moved to a dead-letter list.
    pub dead_letters: Counter,
    /// Replica mirror writes that failed.
    pub mirror_failures: Counter,
    /// Drains that ran under the partition lease.
    pub drains_started: Counter,
    /// Drains skipped because another drainer held the lease.
    pub drains_contended: Counter,
    /// Drains running right now.
    pub active_drains: Gauge,
    /// Drain duration.
    pub drain_duration: Histogram,
    /// Partitions created for unseen keys.
    pub partitions_created: Counter,
    /// Replica promotions.
    pub promotions: Counter,
    /// Probes that failed every attempt.
    pub probe_failures: Counter,
    /// Replicas brought back in sync.
    pub replica_repairs: Counter,
    /// Committed splits.
    pub splits_committed: Counter,
    /// Splits that failed and left the parent splitting.
    pub splits_failed: Counter,
    /// Splits rolled back.
    pub splits_aborted: Counter,
    /// Split duration.
    pub split_duration: Histogram,
    /// Reads served.
    pub reads: Counter,
}

impl RouterMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            writes_submitted: Counter::new("router_writes_submitted_total", "Writes submitted"),
            writes_persisted: Counter::new("router_writes_persisted_total", "Writes persisted"),
            write_retries: Counter::new("router_write_retries_total", "Insert retries scheduled"),
            dead_letters: Counter::new("router_dead_letters_total", "Writes dead-lettered"),
            mirror_failures: Counter::new(
                "router_mirror_failures_total",
                "Failed replica mirror writes",
            ),
            drains_started: Counter::new("router_drains_started_total", "Drains started"),
            drains_contended: Counter::new(
                "router_drains_contended_total",
                "Drains skipped on lease contention",
            ),
            active_drains: Gauge::new("router_active_drains", "Drains in progress"),
            drain_duration: Histogram::new("router_drain_duration_seconds", "Drain duration"),
            partitions_created: Counter::new(
                "router_partitions_created_total",
                "Partitions created",
            ),
            promotions: Counter::new("router_promotions_total", "Replica promotions"),
            probe_failures: Counter::new("router_probe_failures_total", "Failed health probes"),
            replica_repairs: Counter::new("router_replica_repairs_total", "Replicas repaired"),
            splits_committed: Counter::new("router_splits_committed_total", "Splits committed"),
            splits_failed: Counter::new("router_splits_failed_total", "Splits failed"),
            splits_aborted: Counter::new("router_splits_aborted_total", "Splits aborted"),
            split_duration: Histogram::new("router_split_duration_seconds", "Split duration"),
            reads: Counter::new("router_reads_total", "Reads served"),
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes_submitted: self.writes_submitted.get(),
            writes_persisted: self.writes_persisted.get(),
            write_retries: self.write_retries.get(),
            dead_letters: self.dead_letters.get(),
            mirror_failures: self.mirror_failures.get(),
            drains_started: self.drains_started.get(),
            drains_contended: self.drains_contended.get(),
            active_drains: self.active_drains.get(),
            peak_active_drains: self.active_drains.peak(),
            partitions_created: self.partitions_created.get(),
            promotions: self.promotions.get(),
            probe_failures: self.probe_failures.get(),
            replica_repairs: self.replica_repairs.get(),
            splits_committed: self.splits_committed.get(),
            splits_failed: self.splits_failed.get(),
            splits_aborted: self.splits_aborted.get(),
            reads: self.reads.get(),
            drain_duration: self.drain_duration.snapshot(),
            split_duration: self.split_duration.snapshot(),
        }
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.writes_submitted,
            &self.writes_persisted,
            &self.write_retries,
            &self.dead_letters,
            &self.mirror_failures,
            &self.drains_started,
            &self.drains_contended,
            &self.partitions_created,
            &self.promotions,
            &self.probe_failures,
            &self.replica_repairs,
            &self.splits_committed,
            &self.splits_failed,
            &self.splits_aborted,
            &self.reads,
        ] {
            counter.render(&mut out);
        }
        self.active_drains.render(&mut out);
        self.drain_duration.render(&mut out);
        self.split_duration.render(&mut out);
        out
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of router metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub writes_submitted: u64,
    pub writes_persisted: u64,
    pub write_retries: u64,
    pub dead_letters: u64,
    pub mirror_failures: u64,
    pub drains_started: u64,
    pub drains_contended: u64,
    pub active_drains: i64,
    pub peak_active_drains: i64,
    pub partitions_created: u64,
    pub promotions: u64,
    pub probe_failures: u64,
    pub replica_repairs: u64,
    pub splits_committed: u64,
    pub splits_failed: u64,
    pub splits_aborted: u64,
    pub reads: u64,
    pub drain_duration: HistogramSnapshot,
    pub split_duration: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_router_metrics_snapshot() {
        let metrics = RouterMetrics::new();
        metrics.writes_submitted.inc();
        metrics.writes_submitted.inc();
        metrics.dead_letters.inc();
        {
            let _drain = metrics.active_drains.track();
            metrics.drain_duration.observe_duration(Duration::from_millis(3));
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.writes_submitted, 2);
        assert_eq!(snap.dead_letters, 1);
        assert_eq!(snap.active_drains, 0);
        assert_eq!(snap.peak_active_drains, 1);
        assert_eq!(snap.drain_duration.count, 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = RouterMetrics::new();
        metrics.promotions.inc();

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE router_promotions_total counter"));
        assert!(output.contains("router_promotions_total 1"));
        assert!(output.contains("router_active_drains 0"));
        assert!(output.contains("router_split_duration_seconds_count 0"));
    }
}
