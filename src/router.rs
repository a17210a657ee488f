//! Public entry point.
//!
//! ```text
//! submit_write(key, payload)
//!   resolve owner (create if unseen) ─▶ next seq ─▶ status Pending ─▶ enqueue
//!        └─ depth >= batch_size: background drain, then split check
//!
//! read_by_key(key)
//!   lookup owner (never creates) ─▶ read target (in-sync replica or primary)
//!        └─ owner is an unfinished split child: also read the parent, newest wins
//! ```

use crate::batch::{BatchEntry, DrainOutcome, WriteBatchQueue};
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::failover::FailoverManager;
use crate::kv::KeyValueStore;
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::partition::{Partition, PartitionId, PartitionMap};
use crate::split::ShardSplitter;
use crate::status::{RequestSnapshot, RequestStatusStore};
use crate::store::PartitionStore;
use crate::types::{Key, Location, Record, RequestId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SEQ_KEY: &str = "seq/writes";
const FLUSH_CONTENTION_BACKOFF: Duration = Duration::from_millis(5);

/// Routes single-key writes and reads to the partition that owns the key.
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    kv: Arc<dyn KeyValueStore>,
    store: Arc<dyn PartitionStore>,
    map: Arc<PartitionMap>,
    failover: Arc<FailoverManager>,
    queue: Arc<WriteBatchQueue>,
    splitter: Arc<ShardSplitter>,
    status: RequestStatusStore,
    metrics: Arc<RouterMetrics>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Router {
    /// Validate `config` and wire every component over the two collaborators.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        store: Arc<dyn PartitionStore>,
        config: RouterConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(RouterMetrics::new());
        let map = Arc::new(
            PartitionMap::new(kv.clone(), store.clone(), &config).with_metrics(metrics.clone()),
        );
        let failover = Arc::new(FailoverManager::new(
            map.clone(),
            store.clone(),
            &config,
            metrics.clone(),
        ));
        let status = RequestStatusStore::new(kv.clone(), config.request_status_ttl);
        let queue = Arc::new(WriteBatchQueue::new(
            kv.clone(),
            map.clone(),
            failover.clone(),
            store.clone(),
            status.clone(),
            config.batch.clone(),
            metrics.clone(),
        ));
        let splitter = Arc::new(ShardSplitter::new(
            kv.clone(),
            map.clone(),
            failover.clone(),
            store.clone(),
            &config,
            metrics.clone(),
        ));

        tracing::info!(
            nodes = config.placement.nodes.len(),
            replicas = config.placement.replicas_per_partition,
            default_span = config.default_span,
            batch_size = config.batch.batch_size,
            max_shard_size = config.split.max_shard_size,
            "Router started"
        );
        Ok(Arc::new(Self {
            config,
            kv,
            store,
            map,
            failover,
            queue,
            splitter,
            status,
            metrics,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Accept a write for asynchronous persistence.
    ///
    /// The returned id can be polled with [`Router::get_request_status`].
    pub async fn submit_write(self: &Arc<Self>, key: Key, payload: impl Into<Bytes>) -> Result<RequestId> {
        let payload = payload.into();
        let partition = self.map.resolve(key).await?;
        let seq = self
            .kv
            .incr(SEQ_KEY, 1)
            .await
            .map_err(|e| Error::MapUnavailable(e.to_string()))?;

        let request_id = uuid::Uuid::new_v4();
        self.status
            .create(request_id, key, payload.clone())
            .await
            .map_err(Error::into_map_error)?;
        let depth = self
            .queue
            .enqueue(partition.id, &BatchEntry::new(request_id, key, payload, seq))
            .await?;

        if depth >= self.config.batch.batch_size {
            self.spawn_drain(partition.id);
        }
        Ok(request_id)
    }

    fn spawn_drain(self: &Arc<Self>, partition_id: PartitionId) {
        let router = Arc::clone(self);
        self.tasks.spawn(async move {
            let cancel = router.shutdown.child_token();
            match router.queue.drain_if_threshold_reached(partition_id, &cancel).await {
                Ok(DrainOutcome::Drained(report)) if report.persisted > 0 => {
                    if let Err(e) = router.splitter.check_and_split(partition_id, &cancel).await {
                        tracing::debug!(partition_id = %partition_id, error = %e, "Split check after drain failed");
                    }
                }
                Ok(_) | Err(Error::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(partition_id = %partition_id, error = %e, "Background drain failed");
                }
            }
        });
    }

    /// Read the record stored under `key`.
    ///
    /// Keys that were never routed are `RecordNotFound` without creating a
    /// partition. A failed replica read falls back to the primary; if that
    /// fails too the read is `AllReplicasUnavailable`.
    pub async fn read_by_key(&self, key: Key) -> Result<Record> {
        self.metrics.reads.inc();
        let Some(owner) = self.map.lookup(key).await? else {
            return Err(Error::RecordNotFound(key));
        };
        let mut found = self.read_from(&owner, key).await?;

        // Until the split commits, the record may not have moved yet.
        if let Some(parent_id) = owner.split_parent() {
            let parent = self.map.get(parent_id).await?;
            if let Some(older) = self.read_from(&parent, key).await? {
                if found.as_ref().map_or(true, |r| r.seq < older.seq) {
                    found = Some(older);
                }
            }
        }
        found.ok_or(Error::RecordNotFound(key))
    }

    async fn read_from(&self, partition: &Partition, key: Key) -> Result<Option<Record>> {
        let target = self.failover.read_target_for(partition).await?;
        match self.select(&target, key).await {
            Ok(record) => Ok(record),
            Err(e) if target != partition.primary => {
                tracing::warn!(
                    partition_id = %partition.id,
                    replica = %target,
                    error = %e,
                    "Replica read failed, falling back to primary"
                );
                self.select(&partition.primary, key).await.map_err(|_| {
                    Error::AllReplicasUnavailable {
                        partition_id: partition.id,
                    }
                })
            }
            Err(_) => Err(Error::AllReplicasUnavailable {
                partition_id: partition.id,
            }),
        }
    }

    async fn select(&self, location: &Location, key: Key) -> Result<Option<Record>> {
        let result = match tokio::time::timeout(
            self.config.batch.store_timeout,
            self.store.select_by_key(location, key),
        )
        .await
        {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout),
        };
        if let Err(e) = &result {
            self.failover.report_failure(location, e);
        }
        result
    }

    /// Status of a submitted write. Unknown and expired ids are `RequestNotFound`.
    pub async fn get_request_status(&self, request_id: RequestId) -> Result<RequestSnapshot> {
        self.status
            .get(request_id)
            .await
            .map_err(Error::into_map_error)
    }

    /// Drain every queue regardless of the batch threshold.
    ///
    /// Waits for background drains first. Returns the number of entries
    /// persisted by this call. A partition whose drain fails is left queued
    /// while the others are still drained; the first such error is returned
    /// at the end.
    pub async fn flush(&self) -> Result<usize> {
        self.wait_idle().await;
        let cancel = self.shutdown.child_token();
        let mut persisted = 0;
        let mut failed: Vec<(PartitionId, Error)> = Vec::new();

        loop {
            let pending: Vec<PartitionId> = self
                .queue
                .pending_partitions()
                .await?
                .into_iter()
                .filter(|id| !failed.iter().any(|(failed_id, _)| failed_id == id))
                .collect();
            if pending.is_empty() {
                break;
            }
            let mut progressed = false;
            let mut contended = false;
            for partition_id in pending {
                match self.queue.drain(partition_id, &cancel).await {
                    Ok(DrainOutcome::Drained(report)) => {
                        persisted += report.persisted;
                        progressed |= report.persisted + report.dead_lettered > 0;
                    }
                    Ok(DrainOutcome::Contended) => contended = true,
                    Ok(DrainOutcome::BelowThreshold { .. }) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        tracing::warn!(partition_id = %partition_id, error = %e, "Flush could not drain partition");
                        failed.push((partition_id, e));
                    }
                }
            }
            if !progressed {
                if !contended {
                    break;
                }
                tokio::time::sleep(FLUSH_CONTENTION_BACKOFF).await;
            }
        }

        tracing::debug!(persisted, failed = failed.len(), "Flushed write queues");
        match failed.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(persisted),
        }
    }

    /// Wait until every background drain spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel background work and wait for it to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Router stopped");
    }

    /// Token cancelled by [`Router::shutdown`].
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Router configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The partition map.
    pub fn map(&self) -> &Arc<PartitionMap> {
        &self.map
    }

    /// The failover manager.
    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// The write queue.
    pub fn queue(&self) -> &Arc<WriteBatchQueue> {
        &self.queue
    }

    /// The shard splitter.
    pub fn splitter(&self) -> &Arc<ShardSplitter> {
        &self.splitter
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Point-in-time copy of the metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, FailoverConfig};
    use crate::kv::MemoryKv;
    use crate::status::RequestStatus;
    use crate::store::MemoryStore;

    fn router(batch_size: usize) -> (Arc<MemoryKv>, Arc<MemoryStore>, Arc<Router>) {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let config = RouterConfig::new(vec!["a".into(), "b".into()])
            .with_batch_config(BatchConfig::new(batch_size).with_retries(3, Duration::from_millis(1)))
            .with_failover_config(
                FailoverConfig::default().with_probe(Duration::from_millis(50), 1),
            );
        let router = Router::new(kv.clone(), store.clone(), config).unwrap();
        (kv, store, router)
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RouterConfig::new(vec!["only".into()]).with_replicas(1);
        let result = Router::new(Arc::new(MemoryKv::new()), Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_submit_then_read() {
        let (_, _, router) = router(10);
        let id = router.submit_write(7, &b"hello"[..]).await.unwrap();
        assert_eq!(
            router.get_request_status(id).await.unwrap().status,
            RequestStatus::Pending
        );
        assert!(matches!(router.read_by_key(7).await, Err(Error::RecordNotFound(7))));

        assert_eq!(router.flush().await.unwrap(), 1);
        assert_eq!(
            router.get_request_status(id).await.unwrap().status,
            RequestStatus::Completed
        );
        let record = router.read_by_key(7).await.unwrap();
        assert_eq!(record.payload, Bytes::from_static(b"hello"));
        assert_eq!(record.request_id, id);
    }

    #[tokio::test]
    async fn test_threshold_triggers_background_drain() {
        let (_, _, router) = router(2);
        router.submit_write(1, &b"a"[..]).await.unwrap();
        router.wait_idle().await;
        assert_eq!(router.metrics().writes_persisted.get(), 0);

        router.submit_write(2, &b"b"[..]).await.unwrap();
        router.wait_idle().await;
        assert_eq!(router.metrics().writes_persisted.get(), 2);
        assert_eq!(router.read_by_key(2).await.unwrap().payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_flush_drains_healthy_partitions_past_a_dead_one() {
        let config = RouterConfig::new(vec!["a".into(), "b".into(), "c".into(), "d".into()])
            .with_replicas(1)
            .with_default_span(100)
            .with_batch_config(BatchConfig::new(100).with_retries(3, Duration::from_millis(1)))
            .with_failover_config(
                FailoverConfig::default().with_probe(Duration::from_millis(50), 1),
            );
        let store = Arc::new(MemoryStore::new());
        let router = Router::new(Arc::new(MemoryKv::new()), store.clone(), config).unwrap();
        for key in [0u64, 100, 200] {
            router.submit_write(key, &b"first"[..]).await.unwrap();
        }
        assert_eq!(router.flush().await.unwrap(), 3);

        // Every copy of the partition owning key 0 goes away.
        let dead = router.map().lookup(0).await.unwrap().unwrap();
        for location in dead.locations() {
            store.set_node_down(&location.node, true);
        }
        let stuck = router.submit_write(0, &b"second"[..]).await.unwrap();
        let fine = router.submit_write(200, &b"second"[..]).await.unwrap();

        assert!(matches!(
            router.flush().await,
            Err(Error::AllReplicasUnavailable { partition_id }) if partition_id == dead.id
        ));
        assert_eq!(
            router.get_request_status(fine).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(
            router.get_request_status(stuck).await.unwrap().status,
            RequestStatus::Pending
        );
        assert_eq!(router.read_by_key(200).await.unwrap().payload, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_later_write_wins() {
        let (_, _, router) = router(10);
        router.submit_write(5, &b"old"[..]).await.unwrap();
        router.submit_write(5, &b"new"[..]).await.unwrap();
        router.flush().await.unwrap();
        assert_eq!(router.read_by_key(5).await.unwrap().payload, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_read_of_unrouted_key_creates_nothing() {
        let (_, _, router) = router(10);
        assert!(matches!(router.read_by_key(99).await, Err(Error::RecordNotFound(99))));
        assert!(router.map().partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_skips_down_replica() {
        let (_, store, router) = router(1);
        router.submit_write(3, &b"x"[..]).await.unwrap();
        router.flush().await.unwrap();

        let partition = router.map().lookup(3).await.unwrap().unwrap();
        store.set_node_down(&partition.replicas[0].node, true);
        let record = router.read_by_key(3).await.unwrap();
        assert_eq!(record.key, 3);

        store.set_node_down(&partition.primary.node, true);
        assert!(matches!(
            router.read_by_key(3).await,
            Err(Error::AllReplicasUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_map_unavailable_is_surfaced() {
        let (kv, _, router) = router(10);
        kv.set_available(false);
        assert!(matches!(
            router.submit_write(1, &b"x"[..]).await,
            Err(Error::MapUnavailable(_))
        ));
        assert!(matches!(router.read_by_key(1).await, Err(Error::MapUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let (_, _, router) = router(10);
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            router.get_request_status(id).await,
            Err(Error::RequestNotFound(found)) if found == id
        ));
    }
}
