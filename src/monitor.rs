//! Periodic operational pass.
//!
//! Each pass runs, in order:
//!
//! 1. split recovery, so interrupted splits are resumed or rolled back
//!    before anything else looks at their partitions;
//! 2. a health check of every live partition (probe, promote, repair);
//! 3. a split check of every active partition, which also reconciles its
//!    stored record count;
//! 4. a drain of every queue whose oldest entry is older than the staleness
//!    bound, so quiet partitions do not wait for a full batch.

use crate::batch::DrainOutcome;
use crate::error::{Error, Result};
use crate::partition::PartitionStatus;
use crate::router::Router;
use crate::split::{RecoveryAction, SplitOutcome};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What one monitor pass did.
#[derive(Debug, Default)]
pub struct MonitorReport {
    /// Partitions health-checked.
    pub partitions_checked: usize,
    /// Replicas promoted to primary.
    pub promotions: usize,
    /// Lagging replicas brought back in sync.
    pub repairs: usize,
    /// Splits committed by the split check.
    pub splits: usize,
    /// Actions taken by split recovery.
    pub recovery: Vec<RecoveryAction>,
    /// Stale queues drained.
    pub stale_drains: usize,
    /// Entries persisted by stale drains.
    pub persisted: usize,
    /// Errors encountered during the pass.
    pub errors: Vec<String>,
}

impl MonitorReport {
    /// Check if the pass changed anything.
    pub fn had_work(&self) -> bool {
        self.promotions > 0
            || self.repairs > 0
            || self.splits > 0
            || !self.recovery.is_empty()
            || self.persisted > 0
    }

    /// Check if there were any errors.
    pub fn had_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn add_error(&mut self, context: &str, error: &Error) {
        self.errors.push(format!("{}: {}", context, error));
    }
}

/// Runs health, split and staleness passes over a router.
#[derive(Debug)]
pub struct Monitor {
    router: Arc<Router>,
}

impl Monitor {
    /// Create a monitor for `router`.
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Run one pass. Stops early only if `cancel` fires or the partition
    /// map cannot be read.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<MonitorReport> {
        let started = Instant::now();
        let mut report = MonitorReport::default();
        let splitter = self.router.splitter();
        let failover = self.router.failover();
        let queue = self.router.queue();

        match splitter.recover(cancel).await {
            Ok(actions) => report.recovery = actions,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => report.add_error("split recovery", &e),
        }

        let partitions = self.router.map().partitions().await?;
        for partition in partitions.iter().filter(|p| p.status != PartitionStatus::Retired) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            report.partitions_checked += 1;
            match failover.check_partition(partition, cancel).await {
                Ok(health) => {
                    report.promotions += usize::from(health.promoted.is_some());
                    report.repairs += health.repaired.len();
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!(partition_id = %partition.id, error = %e, "Health check failed");
                    report.add_error(&format!("health {}", partition.id), &e);
                }
            }
        }

        for partition in partitions.iter().filter(|p| p.is_active()) {
            match splitter.check_and_split(partition.id, cancel).await {
                Ok(SplitOutcome::Split(_)) => report.splits += 1,
                Ok(_) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => report.add_error(&format!("split {}", partition.id), &e),
            }
        }

        let stale_after = queue.config().stale_queue_age;
        for partition_id in queue.pending_partitions().await? {
            let stale = match queue.head_age(partition_id).await? {
                Some(age) => age >= stale_after,
                None => false,
            };
            if !stale {
                continue;
            }
            match queue.drain(partition_id, cancel).await {
                Ok(DrainOutcome::Drained(drained)) => {
                    report.stale_drains += 1;
                    report.persisted += drained.persisted;
                }
                Ok(_) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => report.add_error(&format!("drain {}", partition_id), &e),
            }
        }

        if report.had_work() {
            tracing::info!(
                partitions = report.partitions_checked,
                promotions = report.promotions,
                repairs = report.repairs,
                splits = report.splits,
                recovered = report.recovery.len(),
                stale_drains = report.stale_drains,
                elapsed = ?started.elapsed(),
                "Monitor pass completed"
            );
        }
        if report.had_errors() {
            tracing::warn!(error_count = report.errors.len(), "Monitor pass had errors");
        }
        Ok(report)
    }

    /// Run passes every `monitor_interval` until the router shuts down.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let cancel = self.router.shutdown_token().clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.router.config().monitor_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match monitor.run_once(&cancel).await {
                            Ok(_) | Err(Error::Cancelled) => {}
                            Err(e) => tracing::error!(error = %e, "Monitor pass failed"),
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
