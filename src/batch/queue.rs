//! Durable per-partition write queue and its drainer.

use super::{BatchEntry, DeadLetter, DrainOutcome, DrainReport};
use crate::config::BatchConfig;
use crate::error::{Error, KvError, Result};
use crate::failover::FailoverManager;
use crate::kv::{self, partition_lease_name, KeyValueStore, Lease};
use crate::metrics::RouterMetrics;
use crate::partition::{PartitionId, PartitionMap};
use crate::status::RequestStatusStore;
use crate::store::PartitionStore;
use crate::types::now_ms;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const QUEUE_PREFIX: &str = "queue/";

fn queue_key(id: PartitionId) -> String {
    format!("{}{}", QUEUE_PREFIX, id)
}

fn dead_key(id: PartitionId) -> String {
    format!("dead/{}", id)
}

fn unavailable(e: KvError) -> Error {
    Error::MapUnavailable(e.to_string())
}

/// Per-partition FIFO of pending writes, drained under the partition lease.
#[derive(Debug)]
pub struct WriteBatchQueue {
    kv: Arc<dyn KeyValueStore>,
    map: Arc<PartitionMap>,
    failover: Arc<FailoverManager>,
    store: Arc<dyn PartitionStore>,
    status: RequestStatusStore,
    config: BatchConfig,
    metrics: Arc<RouterMetrics>,
    holder: String,
}

impl WriteBatchQueue {
    /// Create a queue over the given collaborators.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        map: Arc<PartitionMap>,
        failover: Arc<FailoverManager>,
        store: Arc<dyn PartitionStore>,
        status: RequestStatusStore,
        config: BatchConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            kv,
            map,
            failover,
            store,
            status,
            config,
            metrics,
            holder: format!("drainer-{}", uuid::Uuid::new_v4()),
        }
    }

    /// The batch configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Append an entry to a partition's queue. Returns the new depth.
    pub async fn enqueue(&self, partition_id: PartitionId, entry: &BatchEntry) -> Result<usize> {
        let depth = self
            .kv
            .list_push_back(&queue_key(partition_id), kv::encode(entry)?)
            .await
            .map_err(unavailable)?;
        self.metrics.writes_submitted.inc();
        tracing::trace!(
            partition_id = %partition_id,
            request_id = %entry.request_id,
            key = entry.key,
            depth,
            "Enqueued write"
        );
        Ok(depth)
    }

    /// Number of entries waiting in a partition's queue.
    pub async fn depth(&self, partition_id: PartitionId) -> Result<usize> {
        self.kv
            .list_len(&queue_key(partition_id))
            .await
            .map_err(unavailable)
    }

    /// Age of the oldest waiting entry, `None` if the queue is empty.
    pub async fn head_age(&self, partition_id: PartitionId) -> Result<Option<Duration>> {
        let key = queue_key(partition_id);
        let head = self.kv.list_range(&key, 0, 1).await.map_err(unavailable)?;
        let Some(raw) = head.first() else {
            return Ok(None);
        };
        let entry: BatchEntry = kv::decode(&key, raw).map_err(Error::into_map_error)?;
        Ok(Some(Duration::from_millis(
            now_ms().saturating_sub(entry.enqueued_at_ms),
        )))
    }

    /// Partitions with a non-empty queue.
    pub async fn pending_partitions(&self) -> Result<Vec<PartitionId>> {
        let keys = self.kv.list_keys(QUEUE_PREFIX).await.map_err(unavailable)?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(QUEUE_PREFIX)?.parse().ok())
            .collect())
    }

    /// Entries of a partition that exhausted their attempts, oldest first.
    pub async fn dead_letters(&self, partition_id: PartitionId) -> Result<Vec<DeadLetter>> {
        let key = dead_key(partition_id);
        let len = self.kv.list_len(&key).await.map_err(unavailable)?;
        self.kv
            .list_range(&key, 0, len)
            .await
            .map_err(unavailable)?
            .iter()
            .map(|raw| kv::decode(&key, raw))
            .collect::<Result<Vec<_>>>()
            .map_err(Error::into_map_error)
    }

    /// Drain a partition's queue if it holds at least `batch_size` entries.
    pub async fn drain_if_threshold_reached(
        &self,
        partition_id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome> {
        let depth = self.depth(partition_id).await?;
        if depth < self.config.batch_size {
            return Ok(DrainOutcome::BelowThreshold { depth });
        }
        self.drain(partition_id, cancel).await
    }

    /// Drain up to `batch_size` entries of a partition's queue.
    ///
    /// Returns `Contended` without waiting if another drainer holds the
    /// partition lease. Entries stay queued until their write is confirmed.
    pub async fn drain(
        &self,
        partition_id: PartitionId,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome> {
        let name = partition_lease_name(partition_id);
        let Some(lease) = self
            .kv
            .try_acquire_lease(&name, &self.holder, self.config.drain_lease_ttl)
            .await
            .map_err(unavailable)?
        else {
            self.metrics.drains_contended.inc();
            tracing::debug!(partition_id = %partition_id, "Partition lease held, skipping drain");
            return Ok(DrainOutcome::Contended);
        };

        self.metrics.drains_started.inc();
        let result = self.drain_locked(partition_id, &lease, cancel).await;
        if let Err(e) = self.kv.release_lease(&lease).await {
            tracing::warn!(partition_id = %partition_id, error = %e, "Failed to release drain lease");
        }
        result.map(DrainOutcome::Drained)
    }

    async fn drain_locked(
        &self,
        partition_id: PartitionId,
        lease: &Lease,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        let _active = self.metrics.active_drains.track();
        let started = Instant::now();
        let key = queue_key(partition_id);
        let mut report = DrainReport::default();

        while report.persisted + report.dead_lettered < self.config.batch_size {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let head = self.kv.list_range(&key, 0, 1).await.map_err(unavailable)?;
            let Some(raw) = head.into_iter().next() else {
                break;
            };
            let mut entry: BatchEntry = match kv::decode(&key, &raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(partition_id = %partition_id, error = %e, "Dropping undecodable queue entry");
                    self.kv.list_pop_front(&key, 1).await.map_err(unavailable)?;
                    continue;
                }
            };

            loop {
                let outcome = tokio::select! {
                    r = self.persist(&entry) => r,
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                };
                match outcome {
                    Ok(()) => {
                        self.status
                            .mark_completed(entry.request_id)
                            .await
                            .map_err(Error::into_map_error)?;
                        self.kv.list_pop_front(&key, 1).await.map_err(unavailable)?;
                        self.metrics.writes_persisted.inc();
                        report.persisted += 1;
                        break;
                    }
                    Err(e @ (Error::MapUnavailable(_) | Error::AllReplicasUnavailable { .. })) => {
                        tracing::warn!(
                            partition_id = %partition_id,
                            request_id = %entry.request_id,
                            error = %e,
                            "Drain aborted"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        entry.attempts += 1;
                        entry.last_error = Some(e.to_string());
                        if entry.attempts >= self.config.max_insert_attempts || !e.is_transient() {
                            self.dead_letter(partition_id, &key, entry, &e).await?;
                            report.dead_lettered += 1;
                            break;
                        }

                        self.kv
                            .list_set(&key, 0, kv::encode(&entry)?)
                            .await
                            .map_err(unavailable)?;
                        self.metrics.write_retries.inc();
                        report.retries += 1;

                        let backoff = self.backoff_with_jitter(entry.attempts);
                        tracing::warn!(
                            partition_id = %partition_id,
                            request_id = %entry.request_id,
                            attempt = entry.attempts,
                            ?backoff,
                            error = %e,
                            "Write failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                        }
                        if !self.renew(lease).await? {
                            report.lease_lost = true;
                            break;
                        }
                    }
                }
            }

            if report.lease_lost || !self.renew(lease).await? {
                report.lease_lost = true;
                tracing::warn!(partition_id = %partition_id, "Drain lease lost, stopping");
                break;
            }
        }

        report.remaining = self.kv.list_len(&key).await.map_err(unavailable)?;
        self.metrics
            .drain_duration
            .observe_duration(started.elapsed());
        tracing::debug!(
            partition_id = %partition_id,
            persisted = report.persisted,
            retries = report.retries,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            elapsed = ?started.elapsed(),
            "Drain finished"
        );
        Ok(report)
    }

    /// Write one entry to the current primary of its owning partition and
    /// mirror it to the replicas.
    ///
    /// The owner is resolved again for every attempt, so a partition split
    /// or failover since the entry was queued is followed.
    async fn persist(&self, entry: &BatchEntry) -> Result<()> {
        let owner = self.map.resolve(entry.key).await?;
        let partition = self.failover.writable_partition(owner.id).await?;
        let record = entry.record();
        let primary = &partition.primary;

        match tokio::time::timeout(
            self.config.store_timeout,
            self.store.insert(primary, record.clone()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let e = Error::from(e);
                self.failover.report_failure(primary, &e);
                return Err(e);
            }
            Err(_) => {
                self.failover.report_failure(primary, &Error::Timeout);
                return Err(Error::Timeout);
            }
        }

        self.failover
            .mirror_write(&partition, &record, self.config.store_timeout)
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        partition_id: PartitionId,
        key: &str,
        entry: BatchEntry,
        error: &Error,
    ) -> Result<()> {
        let reason = format!("write failed after {} attempts: {}", entry.attempts, error);
        let request_id = entry.request_id;
        let record_key = entry.key;
        let letter = DeadLetter {
            partition_id,
            entry,
            error: reason.clone(),
            dead_at_ms: now_ms(),
        };

        self.kv
            .list_push_back(&dead_key(partition_id), kv::encode(&letter)?)
            .await
            .map_err(unavailable)?;
        self.status
            .mark_failed(request_id, reason.as_str())
            .await
            .map_err(Error::into_map_error)?;
        self.kv.list_pop_front(key, 1).await.map_err(unavailable)?;
        self.metrics.dead_letters.inc();
        tracing::error!(
            partition_id = %partition_id,
            request_id = %request_id,
            key = record_key,
            error = %reason,
            "Write dead-lettered"
        );
        Ok(())
    }

    async fn renew(&self, lease: &Lease) -> Result<bool> {
        Ok(self
            .kv
            .renew_lease(lease, self.config.drain_lease_ttl)
            .await
            .map_err(unavailable)?
            .is_some())
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for(attempt);
        let spread = (base.as_millis() as u64) / 4;
        if spread == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}
