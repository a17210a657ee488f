//! Split execution and recovery.

use super::{RecoveryAction, SplitOutcome, SplitReport};
use crate::config::{RouterConfig, SplitConfig};
use crate::error::{Error, Result};
use crate::failover::FailoverManager;
use crate::kv::{self, partition_lease_name, HeldLease, KeyValueStore};
use crate::metrics::RouterMetrics;
use crate::partition::{Partition, PartitionId, PartitionMap, PartitionStatus};
use crate::store::{migrate_range, PartitionStore};
use crate::types::Key;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const MAX_BEGIN_ATTEMPTS: usize = 3;

/// Splits over-capacity partitions and repairs interrupted splits.
#[derive(Debug)]
pub struct ShardSplitter {
    kv: Arc<dyn KeyValueStore>,
    map: Arc<PartitionMap>,
    failover: Arc<FailoverManager>,
    store: Arc<dyn PartitionStore>,
    config: SplitConfig,
    metrics: Arc<RouterMetrics>,
    holder: String,
}

impl ShardSplitter {
    /// Create a splitter.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        map: Arc<PartitionMap>,
        failover: Arc<FailoverManager>,
        store: Arc<dyn PartitionStore>,
        config: &RouterConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            kv,
            map,
            failover,
            store,
            config: config.split.clone(),
            metrics,
            holder: format!("splitter-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Split `id` at its median key if it holds `max_shard_size` records or more.
    pub async fn check_and_split(
        &self,
        id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<SplitOutcome> {
        let partition = self.map.get(id).await?;
        if !partition.is_active() || partition.split.is_some() {
            return Ok(SplitOutcome::Skipped {
                reason: format!("partition is {}", partition.status),
            });
        }
        let count = self.live_count(&partition).await?;
        if count < self.config.max_shard_size {
            self.map.set_record_count(id, count).await?;
            return Ok(SplitOutcome::BelowThreshold { count });
        }

        let Some(lease) = self.lease(id, cancel).await? else {
            return Ok(SplitOutcome::Contended);
        };
        let result = lease.keep_alive(self.split_locked(id, cancel)).await;
        lease.release().await;

        if let Err(e) = &result {
            self.metrics.splits_failed.inc();
            tracing::error!(partition_id = %id, error = %e, "Split failed, left for recovery");
        }
        result
    }

    async fn split_locked(&self, id: PartitionId, cancel: &CancellationToken) -> Result<SplitOutcome> {
        let started = Instant::now();
        let partition = self.failover.writable_partition(id).await?;
        if !partition.is_active() || partition.split.is_some() {
            return Ok(SplitOutcome::Skipped {
                reason: format!("partition is {}", partition.status),
            });
        }

        let range = partition.range;
        let count = self
            .store
            .count_range(&partition.primary, range.start, range.end)
            .await?;
        if count < self.config.max_shard_size {
            return Ok(SplitOutcome::BelowThreshold { count });
        }
        let pivot = self
            .store
            .nth_key(&partition.primary, range.start, range.end, (count - 1) / 2)
            .await?
            .ok_or_else(|| Error::Internal(format!("no median key in {} of {}", range, id)))?;
        if pivot >= range.end {
            return Ok(SplitOutcome::Skipped {
                reason: format!("median key {} is the end of {}", pivot, range),
            });
        }

        let child = self.map.create_split_child(&partition, pivot).await?;
        if let Err(e) = self.begin(id, child.id, pivot).await {
            if let Err(retire) = self.map.retire(child.id).await {
                tracing::warn!(partition_id = %child.id, error = %retire, "Failed to retire unused split child");
            }
            return Err(e);
        }
        tracing::info!(
            partition_id = %id,
            child_id = %child.id,
            pivot,
            records = count,
            "Split started"
        );

        let mut report = self.finish(id, child.id, pivot, cancel).await?;
        report.elapsed = started.elapsed();
        self.metrics.split_duration.observe_duration(report.elapsed);
        Ok(SplitOutcome::Split(report))
    }

    /// Put the parent in `Splitting` with a plan pointing at the child,
    /// retrying if unrelated metadata changes moved its version.
    async fn begin(&self, id: PartitionId, child: PartitionId, pivot: Key) -> Result<Partition> {
        let mut last = None;
        for _ in 0..MAX_BEGIN_ATTEMPTS {
            let current = self.map.get(id).await?;
            match self.map.begin_split(&current, child, pivot).await {
                Ok(parent) => return Ok(parent),
                Err(e @ Error::VersionConflict { .. }) => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(Error::Internal(format!("could not start split of {}", id))))
    }

    /// Move `(pivot, end]` to the child, bring both replica sets in line and
    /// commit. Safe to call again for a split that already got partway.
    ///
    /// Runs under the parent lease kept alive by the caller; losing it drops
    /// this future with the parent still `Splitting`.
    async fn finish(
        &self,
        parent_id: PartitionId,
        child_id: PartitionId,
        pivot: Key,
        cancel: &CancellationToken,
    ) -> Result<SplitReport> {
        let started = Instant::now();
        let parent = self.failover.writable_partition(parent_id).await?;
        let child = self.failover.writable_partition(child_id).await?;
        let moved = child.range;

        let migration = migrate_range(
            self.store.as_ref(),
            &parent.primary,
            &child.primary,
            moved.start,
            moved.end,
            self.config.migration_chunk_size,
            cancel,
        )
        .await?;

        for replica in &child.replicas {
            let synced = match self.failover.repair_replica(child_id, replica).await {
                Ok(synced) => synced,
                Err(e) => {
                    tracing::warn!(partition_id = %child_id, replica = %replica, error = %e, "Child replica sync failed");
                    false
                }
            };
            if !synced {
                self.map.mark_lagging(child_id, replica).await?;
            }
        }
        for replica in &parent.replicas {
            if let Err(e) = self.store.delete_range(replica, moved.start, moved.end).await {
                tracing::warn!(partition_id = %parent_id, replica = %replica, error = %e, "Failed to trim parent replica");
                self.map.mark_lagging(parent_id, replica).await?;
            }
        }

        let left = self
            .store
            .count_range(&parent.primary, moved.start, moved.end)
            .await?;
        if left > 0 {
            return Err(Error::MigrationIncomplete {
                partition_id: parent_id,
                detail: format!("{} records above pivot {} still on {}", left, pivot, parent.primary),
            });
        }

        let parent_count = self
            .store
            .count_range(&parent.primary, parent.range.start, pivot)
            .await?;
        let child_count = self
            .store
            .count_range(&child.primary, moved.start, moved.end)
            .await?;
        let (parent, child) = self
            .map
            .commit_split(parent_id, child_id, parent_count, child_count)
            .await?;

        self.metrics.splits_committed.inc();
        tracing::info!(
            partition_id = %parent_id,
            child_id = %child_id,
            parent_range = %parent.range,
            child_range = %child.range,
            parent_count,
            child_count,
            migrated = migration.copied,
            "Split committed"
        );
        Ok(SplitReport {
            parent: parent_id,
            child: child_id,
            pivot,
            parent_range: parent.range,
            child_range: child.range,
            parent_count,
            child_count,
            migrated: migration.copied,
            elapsed: started.elapsed(),
        })
    }

    /// Roll back an uncommitted split of `parent_id`.
    ///
    /// Records already moved to the child are copied back, the plan is
    /// dropped and the child retired. Both partition leases are held, so no
    /// drain writes to either side meanwhile.
    pub async fn abort_split(&self, parent_id: PartitionId, cancel: &CancellationToken) -> Result<Partition> {
        let parent = self.map.get(parent_id).await?;
        let (child_id, _) = parent.split_plan().ok_or_else(|| {
            Error::Internal(format!("partition {} has no split in flight", parent_id))
        })?;

        let parent_lease = self.lease_or_timeout(parent_id, cancel).await?;
        let child_lease = match self.lease_or_timeout(child_id, cancel).await {
            Ok(lease) => lease,
            Err(e) => {
                parent_lease.release().await;
                return Err(e);
            }
        };
        let result = parent_lease
            .keep_alive(child_lease.keep_alive(self.abort_locked(parent_id, cancel)))
            .await;
        child_lease.release().await;
        parent_lease.release().await;
        result
    }

    async fn abort_locked(&self, parent_id: PartitionId, cancel: &CancellationToken) -> Result<Partition> {
        let parent = self.map.get(parent_id).await?;
        let (child_id, pivot) = parent.split_plan().ok_or_else(|| {
            Error::Internal(format!("partition {} has no split in flight", parent_id))
        })?;

        let child = match self.map.get(child_id).await {
            Ok(child) => Some(child),
            Err(Error::PartitionNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let child = child.filter(|c| c.status != PartitionStatus::Retired);
        let mut returned = 0;
        if let Some(child) = &child {
            if child.is_active() {
                return Err(Error::Internal(format!(
                    "split of {} into {} is already committed",
                    parent_id, child_id
                )));
            }
            let parent = self.failover.writable_partition(parent_id).await?;
            let child = self.failover.writable_partition(child_id).await?;
            returned = migrate_range(
                self.store.as_ref(),
                &child.primary,
                &parent.primary,
                child.range.start,
                child.range.end,
                self.config.migration_chunk_size,
                cancel,
            )
            .await?
            .copied;
            for replica in &parent.replicas {
                self.map.mark_lagging(parent_id, replica).await?;
            }
        }

        let parent = self.map.cancel_split(parent_id).await?;
        if child.is_some() {
            if let Err(e) = self.map.retire(child_id).await {
                tracing::warn!(partition_id = %child_id, error = %e, "Failed to retire aborted split child");
            }
        }
        self.metrics.splits_aborted.inc();
        tracing::warn!(
            partition_id = %parent_id,
            child_id = %child_id,
            pivot,
            returned,
            "Split aborted"
        );
        Ok(parent)
    }

    /// Find splits left unfinished and carry each forward or roll it back.
    ///
    /// Partitions whose lease is held are skipped; a running split holds it.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<Vec<RecoveryAction>> {
        let partitions = self.map.partitions().await?;
        let by_id: HashMap<PartitionId, &Partition> = partitions.iter().map(|p| (p.id, p)).collect();
        let mut actions = Vec::new();

        for partition in &partitions {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = if let Some((child_id, pivot)) = partition.split_plan() {
                let child_usable = by_id
                    .get(&child_id)
                    .is_some_and(|c| c.status != PartitionStatus::Retired);
                self.recover_parent(partition.id, child_id, pivot, child_usable, cancel)
                    .await
            } else if let Some(parent_id) = partition.split_parent() {
                let claimed = by_id
                    .get(&parent_id)
                    .and_then(|p| p.split_plan())
                    .is_some_and(|(child, _)| child == partition.id);
                if claimed {
                    continue;
                }
                self.retire_orphan(partition.id, parent_id).await
            } else {
                continue;
            };

            match result {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(partition_id = %partition.id, error = %e, "Split recovery failed");
                    actions.push(RecoveryAction::Failed {
                        partition_id: partition.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(actions)
    }

    async fn recover_parent(
        &self,
        parent_id: PartitionId,
        child_id: PartitionId,
        pivot: Key,
        child_usable: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<RecoveryAction>> {
        if !child_usable {
            self.abort_split(parent_id, cancel).await?;
            return Ok(Some(RecoveryAction::Aborted {
                parent: parent_id,
                child: child_id,
            }));
        }

        let Some(lease) = self.try_lease(parent_id).await? else {
            return Ok(None);
        };
        let result = lease
            .keep_alive(async {
                // The plan may have moved on while the lease was held elsewhere.
                let parent = self.map.get(parent_id).await?;
                if parent.split_plan() != Some((child_id, pivot)) {
                    return Ok(None);
                }
                tracing::info!(partition_id = %parent_id, child_id = %child_id, pivot, "Resuming split");
                self.finish(parent_id, child_id, pivot, cancel)
                    .await
                    .map(|report| Some(RecoveryAction::Resumed(report)))
            })
            .await;
        lease.release().await;
        if result.is_err() {
            self.metrics.splits_failed.inc();
        }
        result
    }

    /// Retire a split child that its parent no longer points at. Runs under
    /// the parent's lease, which the split holds between creating the child
    /// and recording the plan.
    async fn retire_orphan(&self, child_id: PartitionId, parent_id: PartitionId) -> Result<Option<RecoveryAction>> {
        let Some(lease) = self.try_lease(parent_id).await? else {
            return Ok(None);
        };
        let result = async {
            let claimed = match self.map.get(parent_id).await {
                Ok(parent) => parent.split_plan().is_some_and(|(child, _)| child == child_id),
                Err(Error::PartitionNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            let child = self.map.get(child_id).await?;
            if claimed || child.split_parent() != Some(parent_id) {
                return Ok(None);
            }
            self.map.retire(child_id).await?;
            tracing::warn!(partition_id = %child_id, parent_id = %parent_id, "Retired orphaned split child");
            Ok(Some(RecoveryAction::OrphanRetired { child: child_id }))
        }
        .await;
        lease.release().await;
        result
    }

    async fn live_count(&self, partition: &Partition) -> Result<u64> {
        let target = self.failover.current_read_target(partition.id).await?;
        Ok(self
            .store
            .count_range(&target, partition.range.start, partition.range.end)
            .await?)
    }

    /// Blocking lease acquisition. `None` when it timed out.
    async fn lease(&self, id: PartitionId, cancel: &CancellationToken) -> Result<Option<HeldLease>> {
        match self.lease_or_timeout(id, cancel).await {
            Ok(lease) => Ok(Some(lease)),
            Err(Error::LeaseTimeout(name)) => {
                tracing::debug!(partition_id = %id, lease = %name, "Split lease busy, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn lease_or_timeout(&self, id: PartitionId, cancel: &CancellationToken) -> Result<HeldLease> {
        let lease = kv::acquire_blocking(
            self.kv.as_ref(),
            &partition_lease_name(id),
            &self.holder,
            self.config.lease_ttl,
            self.config.lease_timeout,
            cancel,
        )
        .await
        .map_err(Error::into_map_error)?;
        Ok(HeldLease::new(self.kv.clone(), lease, self.config.lease_ttl))
    }

    async fn try_lease(&self, id: PartitionId) -> Result<Option<HeldLease>> {
        let lease = self
            .kv
            .try_acquire_lease(&partition_lease_name(id), &self.holder, self.config.lease_ttl)
            .await
            .map_err(|e| Error::MapUnavailable(e.to_string()))?;
        Ok(lease.map(|lease| HeldLease::new(self.kv.clone(), lease, self.config.lease_ttl)))
    }
}
