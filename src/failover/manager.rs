//! Replica failover state machine.
//!
//! ```text
//!  HealthyPrimary ──primary probe fails──▶ Degraded ──▶ Promoting
//!        ▲                                                 │
//!        │           swap committed in the partition map   │
//!        └─────────────────────────────────────────────────┘
//!                          no eligible replica: stays Degraded,
//!                          callers get AllReplicasUnavailable
//! ```
//!
//! Promotion is serialized per partition and committed as one versioned swap
//! in the partition map, so readers always see exactly one primary. The old
//! primary rejoins at the end of the replica list, marked lagging until
//! [`FailoverManager::repair_replica`] brings it back in sync.

use super::health::{HealthProber, HealthStatus};
use crate::config::{FailoverConfig, RouterConfig};
use crate::error::{Error, Result};
use crate::metrics::RouterMetrics;
use crate::partition::{KeyRange, Partition, PartitionId, PartitionMap};
use crate::store::{range_checksum, PartitionStore};
use crate::types::{now_ms, Key, Location, Record};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const MAX_PROMOTION_ATTEMPTS: usize = 3;

/// Failover state of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// The primary answered recently.
    HealthyPrimary,
    /// The primary failed and no promotion is running.
    Degraded,
    /// A replica is being promoted.
    Promoting,
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverState::HealthyPrimary => write!(f, "healthy-primary"),
            FailoverState::Degraded => write!(f, "degraded"),
            FailoverState::Promoting => write!(f, "promoting"),
        }
    }
}

/// Outcome of one health pass over a partition.
#[derive(Debug, Clone)]
pub struct PartitionHealth {
    /// The partition checked.
    pub partition_id: PartitionId,
    /// Status of the primary before any promotion.
    pub primary_status: HealthStatus,
    /// New primary, if one was promoted.
    pub promoted: Option<Location>,
    /// Replicas brought back in sync.
    pub repaired: Vec<Location>,
    /// Replicas still lagging after the pass.
    pub still_lagging: usize,
}

/// Tracks primary/replica roles and moves writes off failed primaries.
#[derive(Debug)]
pub struct FailoverManager {
    map: Arc<PartitionMap>,
    store: Arc<dyn PartitionStore>,
    prober: HealthProber,
    config: FailoverConfig,
    repair_chunk_size: usize,
    metrics: Arc<RouterMetrics>,
    states: DashMap<PartitionId, FailoverState>,
    promotion_locks: DashMap<PartitionId, Arc<Mutex<()>>>,
    read_cursors: DashMap<PartitionId, usize>,
}

impl FailoverManager {
    /// Create a failover manager.
    pub fn new(
        map: Arc<PartitionMap>,
        store: Arc<dyn PartitionStore>,
        config: &RouterConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            prober: HealthProber::new(store.clone(), config.failover.clone(), metrics.clone()),
            map,
            store,
            config: config.failover.clone(),
            repair_chunk_size: config.split.migration_chunk_size.max(1),
            metrics,
            states: DashMap::new(),
            promotion_locks: DashMap::new(),
            read_cursors: DashMap::new(),
        }
    }

    /// The health prober.
    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    /// Current failover state of a partition.
    pub fn state(&self, id: PartitionId) -> FailoverState {
        self.states
            .get(&id)
            .map_or(FailoverState::HealthyPrimary, |s| *s)
    }

    fn set_state(&self, id: PartitionId, state: FailoverState) {
        let previous = self.states.insert(id, state);
        if previous != Some(state) && !(previous.is_none() && state == FailoverState::HealthyPrimary)
        {
            tracing::debug!(partition_id = %id, state = %state, "Failover state changed");
        }
    }

    /// Record that an operation against `location` failed, so the next
    /// target selection probes it again.
    pub fn report_failure(&self, location: &Location, error: &Error) {
        self.prober.record_failure(location, &error.to_string());
    }

    /// Location writes for `id` should go to.
    ///
    /// Blocks while a promotion runs. Fails with `AllReplicasUnavailable`
    /// when the primary is down and no replica can take over.
    pub async fn current_write_target(&self, id: PartitionId) -> Result<Location> {
        Ok(self.writable_partition(id).await?.primary)
    }

    /// Fresh partition record whose primary is fit for writes.
    pub async fn writable_partition(&self, id: PartitionId) -> Result<Partition> {
        let partition = self.map.get(id).await?;
        if self.prober.check(&partition.primary).await {
            self.set_state(id, FailoverState::HealthyPrimary);
            return Ok(partition);
        }

        self.set_state(id, FailoverState::Degraded);
        tracing::warn!(
            partition_id = %id,
            primary = %partition.primary,
            "Primary unhealthy, starting promotion"
        );
        // Bounded by the promotion timeout.
        self.promote_from(id, &partition.primary, &CancellationToken::new())
            .await
    }

    /// Location a read for `id` should go to.
    pub async fn current_read_target(&self, id: PartitionId) -> Result<Location> {
        let partition = self.map.get(id).await?;
        self.read_target_for(&partition).await
    }

    /// Round-robin over healthy in-sync replicas, then the primary.
    pub async fn read_target_for(&self, partition: &Partition) -> Result<Location> {
        let replicas = partition.in_sync_replicas();
        if !replicas.is_empty() {
            let start = {
                let mut cursor = self.read_cursors.entry(partition.id).or_insert(0);
                let start = *cursor;
                *cursor = cursor.wrapping_add(1);
                start
            };
            for i in 0..replicas.len() {
                let replica = &replicas[(start + i) % replicas.len()];
                if self.prober.check(replica).await {
                    return Ok(replica.clone());
                }
            }
        }

        if self.prober.check(&partition.primary).await {
            return Ok(partition.primary.clone());
        }
        Err(Error::AllReplicasUnavailable {
            partition_id: partition.id,
        })
    }

    /// Promote the first eligible replica of `id` to primary.
    ///
    /// Gives up with `Cancelled` when `cancel` fires and with `Timeout` after
    /// `promotion_timeout`, whether still queued behind another promotion or
    /// probing candidates. The map is never left half-swapped.
    pub async fn promote(&self, id: PartitionId, cancel: &CancellationToken) -> Result<Partition> {
        let partition = self.map.get(id).await?;
        self.promote_from(id, &partition.primary, cancel).await
    }

    async fn promote_from(
        &self,
        id: PartitionId,
        failed: &Location,
        cancel: &CancellationToken,
    ) -> Result<Partition> {
        let timeout = self.config.promotion_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.promote_locked(id, failed)) => {
                result.unwrap_or_else(|_| {
                    tracing::warn!(partition_id = %id, ?timeout, "Promotion timed out");
                    Err(Error::Timeout)
                })
            }
        };
        if matches!(outcome, Err(Error::Cancelled | Error::Timeout)) {
            self.set_state(id, FailoverState::Degraded);
        }
        outcome
    }

    /// Replace `failed` as primary of `id`.
    ///
    /// If another task already replaced it while this one waited for the
    /// promotion lock, the current record is returned unchanged.
    async fn promote_locked(&self, id: PartitionId, failed: &Location) -> Result<Partition> {
        let lock = self.promotion_locks.entry(id).or_default().clone();
        let _guard = lock.lock().await;

        for _ in 0..MAX_PROMOTION_ATTEMPTS {
            let partition = self.map.get(id).await?;
            if &partition.primary != failed {
                self.set_state(id, FailoverState::HealthyPrimary);
                return Ok(partition);
            }

            self.set_state(id, FailoverState::Promoting);
            let Some(candidate) = self.select_candidate(&partition).await else {
                self.set_state(id, FailoverState::Degraded);
                tracing::error!(
                    partition_id = %id,
                    primary = %partition.primary,
                    replicas = partition.replicas.len(),
                    "No replica eligible for promotion"
                );
                return Err(Error::AllReplicasUnavailable { partition_id: id });
            };

            match self.map.swap_primary(id, partition.version, &candidate).await {
                Ok(promoted) => {
                    self.set_state(id, FailoverState::HealthyPrimary);
                    self.metrics.promotions.inc();
                    tracing::info!(
                        partition_id = %id,
                        old_primary = %failed,
                        new_primary = %promoted.primary,
                        "Promoted replica to primary"
                    );
                    return Ok(promoted);
                }
                Err(Error::VersionConflict { .. }) => {
                    tracing::debug!(partition_id = %id, "Partition changed during promotion, retrying");
                }
                Err(e) => {
                    self.set_state(id, FailoverState::Degraded);
                    return Err(e);
                }
            }
        }

        self.set_state(id, FailoverState::Degraded);
        Err(Error::AllReplicasUnavailable { partition_id: id })
    }

    /// First replica in priority order that is within the lag bound and
    /// passes a live probe.
    async fn select_candidate(&self, partition: &Partition) -> Option<Location> {
        let max_lag = self.config.max_promotion_lag.as_millis() as u64;
        let now = now_ms();
        for replica in &partition.replicas {
            if partition.is_lagging(replica) && (max_lag == 0 || partition.lag_ms(replica, now) > max_lag)
            {
                tracing::debug!(
                    partition_id = %partition.id,
                    replica = %replica,
                    lag_ms = partition.lag_ms(replica, now),
                    "Skipping lagging replica"
                );
                continue;
            }
            if self.prober.probe(replica).await {
                return Some(replica.clone());
            }
        }
        None
    }

    /// Copy a persisted record to every replica of `partition`.
    ///
    /// Replicas that fail are marked lagging. Returns how many succeeded.
    pub async fn mirror_write(
        &self,
        partition: &Partition,
        record: &Record,
        timeout: Duration,
    ) -> Result<usize> {
        let mut mirrored = 0;
        for replica in &partition.replicas {
            let error = match tokio::time::timeout(timeout, self.store.insert(replica, record.clone()))
                .await
            {
                Ok(Ok(_)) => {
                    mirrored += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("mirror timed out after {:?}", timeout),
            };
            self.metrics.mirror_failures.inc();
            self.prober.record_failure(replica, &error);
            tracing::warn!(
                partition_id = %partition.id,
                replica = %replica,
                key = record.key,
                error = %error,
                "Mirror write failed"
            );
            self.map.mark_lagging(partition.id, replica).await?;
        }
        Ok(mirrored)
    }

    /// Bring a lagging replica back in sync with the primary.
    ///
    /// Rows outside the owned range are dropped, rows only the replica holds
    /// (or holds newer) are written back to the primary, then the primary is
    /// copied over. The lagging mark is cleared only if both copies end with
    /// the same checksum and no write was missed while the repair ran.
    /// Returns whether the replica is in sync.
    pub async fn repair_replica(&self, id: PartitionId, replica: &Location) -> Result<bool> {
        let partition = self.map.get(id).await?;
        if !partition.replicas.contains(replica) || !self.prober.check(replica).await {
            return Ok(false);
        }
        let seen = partition.lag_of(replica).cloned();
        let primary = partition.primary.clone();
        let owned = owned_range(&partition);

        self.store.provision(replica).await?;
        if owned.start > 0 {
            self.store.delete_range(replica, 0, owned.start - 1).await?;
        }
        if owned.end < Key::MAX {
            self.store.delete_range(replica, owned.end + 1, Key::MAX).await?;
        }

        let recovered = self.back_fill(replica, &primary, owned).await?;
        if recovered > 0 {
            tracing::warn!(
                partition_id = %id,
                replica = %replica,
                recovered,
                "Recovered writes held only by a replica"
            );
        }
        self.copy_range(&primary, replica, owned).await?;

        let expected = range_checksum(self.store.as_ref(), &primary, owned.start, owned.end, self.repair_chunk_size).await?;
        let actual = range_checksum(self.store.as_ref(), replica, owned.start, owned.end, self.repair_chunk_size).await?;
        if expected != actual {
            tracing::debug!(
                partition_id = %id,
                replica = %replica,
                primary_count = expected.count,
                replica_count = actual.count,
                "Replica still differs after repair"
            );
            return Ok(false);
        }

        if !self.map.clear_lagging_if(id, replica, seen.as_ref()).await? {
            tracing::debug!(
                partition_id = %id,
                replica = %replica,
                "Replica missed a write during repair, keeping it lagging"
            );
            return Ok(false);
        }
        self.metrics.replica_repairs.inc();
        tracing::info!(partition_id = %id, replica = %replica, records = actual.count, "Replica repaired");
        Ok(true)
    }

    /// Write rows the replica holds newer than the primary back to the primary.
    async fn back_fill(&self, replica: &Location, primary: &Location, range: KeyRange) -> Result<usize> {
        let mut recovered = 0;
        let mut cursor = range.start;
        loop {
            let rows = self
                .store
                .scan_range(replica, cursor, range.end, self.repair_chunk_size)
                .await?;
            let (Some(first), Some(last)) = (rows.first().map(|r| r.key), rows.last().map(|r| r.key))
            else {
                break;
            };
            let on_primary: HashMap<Key, u64> = self
                .store
                .scan_range(primary, first, last, usize::MAX)
                .await?
                .into_iter()
                .map(|r| (r.key, r.seq))
                .collect();
            let newer: Vec<Record> = rows
                .into_iter()
                .filter(|r| on_primary.get(&r.key).map_or(true, |seq| *seq < r.seq))
                .collect();
            if !newer.is_empty() {
                recovered += self.store.insert_many(primary, newer).await?;
            }
            if last >= range.end {
                break;
            }
            cursor = last + 1;
        }
        Ok(recovered)
    }

    async fn copy_range(&self, from: &Location, to: &Location, range: KeyRange) -> Result<()> {
        let mut cursor = range.start;
        loop {
            let rows = self
                .store
                .scan_range(from, cursor, range.end, self.repair_chunk_size)
                .await?;
            let Some(last) = rows.last().map(|r| r.key) else {
                break;
            };
            self.store.insert_many(to, rows).await?;
            if last >= range.end {
                break;
            }
            cursor = last + 1;
        }
        Ok(())
    }

    /// Probe every copy of a partition, promote if the primary is down and
    /// repair lagging replicas that answer again.
    pub async fn check_partition(
        &self,
        partition: &Partition,
        cancel: &CancellationToken,
    ) -> Result<PartitionHealth> {
        let id = partition.id;
        let primary_ok = self.prober.probe(&partition.primary).await;
        let primary_status = self.prober.status(&partition.primary);
        for replica in &partition.replicas {
            self.prober.probe(replica).await;
        }

        let mut promoted = None;
        let mut current = partition.clone();
        if primary_ok {
            self.set_state(id, FailoverState::HealthyPrimary);
        } else {
            self.set_state(id, FailoverState::Degraded);
            current = self.promote_from(id, &partition.primary, cancel).await?;
            if current.primary != partition.primary {
                promoted = Some(current.primary.clone());
            }
        }

        let mut repaired = Vec::new();
        for lag in current.lagging.clone() {
            if !self.prober.is_fresh(&lag.location) {
                continue;
            }
            match self.repair_replica(id, &lag.location).await {
                Ok(true) => repaired.push(lag.location),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(partition_id = %id, replica = %lag.location, error = %e, "Replica repair failed");
                }
            }
        }

        Ok(PartitionHealth {
            partition_id: id,
            primary_status,
            promoted,
            still_lagging: current.lagging.len() - repaired.len(),
            repaired,
        })
    }
}

/// Keys a partition answers for: the whole range, or up to the pivot while
/// it is the parent of a split.
fn owned_range(partition: &Partition) -> KeyRange {
    match partition.split_plan() {
        Some((_, pivot)) if partition.range.contains(pivot) => {
            KeyRange::new(partition.range.start, pivot)
        }
        _ => partition.range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        map: Arc<PartitionMap>,
        failover: FailoverManager,
        metrics: Arc<RouterMetrics>,
    }

    fn fixture(nodes: &[&str], replicas: usize) -> Fixture {
        fixture_with(
            nodes,
            replicas,
            FailoverConfig::default().with_probe(Duration::from_millis(50), 2),
        )
    }

    fn fixture_with(nodes: &[&str], replicas: usize, failover: FailoverConfig) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let config = RouterConfig::new(nodes.iter().map(|n| n.to_string()).collect())
            .with_replicas(replicas)
            .with_failover_config(failover);
        let map = Arc::new(PartitionMap::new(kv, store.clone(), &config));
        let metrics = Arc::new(RouterMetrics::new());
        let failover = FailoverManager::new(map.clone(), store.clone(), &config, metrics.clone());
        Fixture {
            store,
            map,
            failover,
            metrics,
        }
    }

    fn record(key: Key, seq: u64) -> Record {
        Record::new(key, vec![1, 2, 3], seq, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_write_target_is_primary_when_healthy() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();

        let target = f.failover.current_write_target(p.id).await.unwrap();
        assert_eq!(target, p.primary);
        assert_eq!(f.failover.state(p.id), FailoverState::HealthyPrimary);
    }

    #[tokio::test]
    async fn test_failed_primary_is_replaced() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();
        let (a, b) = (p.primary.clone(), p.replicas[0].clone());

        f.store.set_node_down(&a.node, true);
        let target = f.failover.current_write_target(p.id).await.unwrap();
        assert_eq!(target, b);

        let after = f.map.get(p.id).await.unwrap();
        assert_eq!(after.primary, b);
        assert_eq!(after.replicas, vec![a.clone()]);
        assert!(after.is_lagging(&a));
        assert!(after.last_failover_at_ms.is_some());
        assert_eq!(f.metrics.promotions.get(), 1);

        // Later callers see the new primary without another promotion.
        assert_eq!(f.failover.current_write_target(p.id).await.unwrap(), b);
        assert_eq!(f.metrics.promotions.get(), 1);
    }

    #[tokio::test]
    async fn test_all_replicas_unavailable() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();
        f.store.set_node_down("a", true);
        f.store.set_node_down("b", true);

        let result = f.failover.current_write_target(p.id).await;
        assert!(matches!(result, Err(Error::AllReplicasUnavailable { .. })));
        assert_eq!(f.failover.state(p.id), FailoverState::Degraded);
        assert!(matches!(
            f.failover.current_read_target(p.id).await,
            Err(Error::AllReplicasUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_lagging_replica_not_promoted() {
        let f = fixture(&["a", "b", "c"], 2);
        let p = f.map.resolve(1).await.unwrap();
        let first = p.replicas[0].clone();
        let second = p.replicas[1].clone();
        f.map.mark_lagging(p.id, &first).await.unwrap();

        let promoted = f.failover.promote(p.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(promoted.primary, second);
    }

    #[tokio::test]
    async fn test_read_target_round_robins_and_falls_back() {
        let f = fixture(&["a", "b", "c"], 2);
        let p = f.map.resolve(1).await.unwrap();

        let first = f.failover.current_read_target(p.id).await.unwrap();
        let second = f.failover.current_read_target(p.id).await.unwrap();
        assert_ne!(first, second);
        assert!(p.replicas.contains(&first) && p.replicas.contains(&second));

        for replica in &p.replicas {
            f.store.set_node_down(&replica.node, true);
            f.failover.report_failure(replica, &Error::Timeout);
        }
        assert_eq!(f.failover.current_read_target(p.id).await.unwrap(), p.primary);
    }

    #[tokio::test]
    async fn test_mirror_failure_marks_lagging_and_repair_clears_it() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();
        let replica = p.replicas[0].clone();

        f.store.insert(&p.primary, record(1, 1)).await.unwrap();
        f.store.fail_next_inserts(&replica.node, 1);
        let mirrored = f
            .failover
            .mirror_write(&p, &record(1, 1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(mirrored, 0);
        assert!(f.map.get(p.id).await.unwrap().is_lagging(&replica));

        assert!(f.failover.repair_replica(p.id, &replica).await.unwrap());
        assert!(!f.map.get(p.id).await.unwrap().is_lagging(&replica));
        assert_eq!(f.store.keys_at(&replica), vec![1]);
    }

    #[tokio::test]
    async fn test_repair_recovers_writes_only_on_old_primary() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();
        let (a, b) = (p.primary.clone(), p.replicas[0].clone());

        f.store.insert(&a, record(5, 7)).await.unwrap();
        let promoted = f.map.swap_primary(p.id, p.version, &b).await.unwrap();
        assert_eq!(promoted.primary, b);

        assert!(f.failover.repair_replica(p.id, &a).await.unwrap());
        assert_eq!(f.store.select_by_key(&b, 5).await.unwrap().unwrap().seq, 7);
    }

    #[tokio::test]
    async fn test_check_partition_promotes_and_repairs() {
        let f = fixture(&["a", "b"], 1);
        let p = f.map.resolve(1).await.unwrap();
        let a = p.primary.clone();

        f.store.set_node_down(&a.node, true);
        let cancel = CancellationToken::new();
        let health = f.failover.check_partition(&p, &cancel).await.unwrap();
        assert_eq!(health.promoted, Some(p.replicas[0].clone()));
        assert_eq!(health.still_lagging, 1);

        f.store.set_node_down(&a.node, false);
        let current = f.map.get(p.id).await.unwrap();
        let health = f.failover.check_partition(&current, &cancel).await.unwrap();
        assert!(health.promoted.is_none());
        assert_eq!(health.repaired, vec![a]);
        assert_eq!(health.still_lagging, 0);
    }

    #[tokio::test]
    async fn test_cancel_caller_queued_behind_promotion() {
        let f = Arc::new(fixture(&["a", "b"], 1));
        let p = f.map.resolve(1).await.unwrap();
        let (id, b) = (p.id, p.replicas[0].clone());
        f.store.set_node_down("a", true);
        // Probing the candidate keeps the first promotion busy.
        f.store.set_latency("b", Some(Duration::from_millis(40)));

        let first = {
            let f = f.clone();
            tokio::spawn(async move { f.failover.promote(id, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let queued = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.failover.promote(id, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let result = queued.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)), "{:?}", result);
        assert!(!first.is_finished());

        let promoted = first.await.unwrap().unwrap();
        assert_eq!(promoted.primary, b);
        assert_eq!(f.metrics.promotions.get(), 1);
    }

    #[tokio::test]
    async fn test_promotion_gives_up_after_timeout() {
        let f = fixture_with(
            &["a", "b"],
            1,
            FailoverConfig::default()
                .with_probe(Duration::from_millis(200), 1)
                .with_promotion_timeout(Duration::from_millis(20)),
        );
        let p = f.map.resolve(1).await.unwrap();
        f.store.set_node_down("a", true);
        f.store.set_latency("b", Some(Duration::from_millis(100)));

        let result = f.failover.promote(p.id, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Timeout)), "{:?}", result);
        assert_eq!(f.failover.state(p.id), FailoverState::Degraded);
        // Nothing was swapped.
        assert_eq!(f.map.get(p.id).await.unwrap().primary, p.primary);
    }

    #[tokio::test]
    async fn test_write_missed_during_repair_keeps_replica_lagging() {
        let f = Arc::new(fixture(&["a", "b"], 1));
        let p = f.map.resolve(1).await.unwrap();
        let replica = p.replicas[0].clone();
        f.store.insert(&p.primary, record(1, 1)).await.unwrap();
        f.map.mark_lagging(p.id, &replica).await.unwrap();
        f.store.set_latency(&replica.node, Some(Duration::from_millis(5)));

        let repair = {
            let (f, id, replica) = (f.clone(), p.id, replica.clone());
            tokio::spawn(async move { f.failover.repair_replica(id, &replica).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // A write mirrored while the repair is copying fails on the replica.
        f.store.insert(&p.primary, record(2, 2)).await.unwrap();
        f.map.mark_lagging(p.id, &replica).await.unwrap();

        assert!(!repair.await.unwrap().unwrap());
        let after = f.map.get(p.id).await.unwrap();
        assert!(after.is_lagging(&replica));
        assert_eq!(f.metrics.replica_repairs.get(), 0);

        // A quiet pass clears it.
        assert!(f.failover.repair_replica(p.id, &replica).await.unwrap());
        assert!(!f.map.get(p.id).await.unwrap().is_lagging(&replica));
        assert_eq!(f.store.keys_at(&replica), vec![1, 2]);
    }
}
