//! Durable partition registry.
//!
//! Partition records live in the key-value store under `map/partition/<id>`
//! and every mutation is a compare-and-set against the stored bytes, so two
//! writers racing on the same partition can never both win. After each
//! successful mutation the `map/version` counter is bumped; readers keep a
//! cached index and reload it whenever that counter moves.
//!
//! ```text
//!   resolve(key)
//!        │
//!        ▼
//!   ┌──────────────┐   hit    ┌──────────────────────┐
//!   │ lookup(key)  │────────▶ │ owner (split-aware)  │
//!   └──────────────┘          └──────────────────────┘
//!        │ miss
//!        ▼
//!   creation locks for the blocks [key, key+span) touches
//!        │
//!        ▼
//!   reload ─▶ still missing? ─▶ clip range ─▶ provision all copies ─▶ CAS record
//!                                              (rolled back on failure)
//! ```

use super::placement::Placement;
use super::types::{KeyRange, Partition, PartitionId, PartitionStatus, ReplicaLag, SplitRole};
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::kv::{self, creation_lock_name, KeyValueStore, Lease};
use crate::metrics::RouterMetrics;
use crate::store::PartitionStore;
use crate::types::{now_ms, Key, Location};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

const VERSION_KEY: &str = "map/version";
const PARTITION_PREFIX: &str = "map/partition/";
const MAX_CAS_ATTEMPTS: usize = 8;
const CREATION_LOCK_TTL: Duration = Duration::from_secs(30);

fn partition_key(id: PartitionId) -> String {
    format!("{}{}", PARTITION_PREFIX, id)
}

fn unavailable(e: impl std::fmt::Display) -> Error {
    Error::MapUnavailable(e.to_string())
}

/// In-memory view of the map at one version.
#[derive(Debug, Default)]
struct MapIndex {
    version: u64,
    partitions: HashMap<PartitionId, Partition>,
    /// Routable partitions by range start.
    routable: BTreeMap<Key, PartitionId>,
}

impl MapIndex {
    fn build(version: u64, partitions: Vec<Partition>) -> Self {
        let routable = partitions
            .iter()
            .filter(|p| p.is_routable())
            .map(|p| (p.range.start, p.id))
            .collect();
        Self {
            version,
            partitions: partitions.into_iter().map(|p| (p.id, p)).collect(),
            routable,
        }
    }

    /// The partition that owns `key` right now.
    ///
    /// While a split is in flight the parent's plan redirects keys above the
    /// pivot to the child. Between the two commit steps the child is already
    /// routable and starts after the parent, so it is found first.
    fn owner(&self, key: Key) -> Option<&Partition> {
        let direct = self
            .routable
            .range(..=key)
            .rev()
            .take(2)
            .filter_map(|(_, id)| self.partitions.get(id))
            .find(|p| p.range.contains(key))?;

        if let Some((child_id, pivot)) = direct.split_plan() {
            if key > pivot {
                if let Some(child) = self
                    .partitions
                    .get(&child_id)
                    .filter(|c| c.status != PartitionStatus::Retired)
                {
                    return Some(child);
                }
            }
        }
        Some(direct)
    }

    fn next_start_after(&self, key: Key) -> Option<Key> {
        self.routable
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(start, _)| *start)
    }
}

/// Authoritative registry of partitions, their ranges and roles.
#[derive(Debug)]
pub struct PartitionMap {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<dyn PartitionStore>,
    placement: Placement,
    default_span: u64,
    lock_buckets: u32,
    lock_timeout: Duration,
    holder: String,
    index: RwLock<Option<Arc<MapIndex>>>,
    metrics: Option<Arc<RouterMetrics>>,
}

impl PartitionMap {
    /// Create a map over the given collaborators.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        store: Arc<dyn PartitionStore>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            kv,
            store,
            placement: Placement::new(config.placement.clone()),
            default_span: config.default_span.max(1),
            lock_buckets: config.creation_lock_buckets.max(1),
            lock_timeout: config.creation_lock_timeout,
            holder: format!("map-{}", uuid::Uuid::new_v4()),
            index: RwLock::new(None),
            metrics: None,
        }
    }

    /// Count created partitions in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<RouterMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current map version.
    pub async fn version(&self) -> Result<u64> {
        kv::get_counter(self.kv.as_ref(), VERSION_KEY)
            .await
            .map_err(Error::into_map_error)
    }

    async fn snapshot(&self) -> Result<Arc<MapIndex>> {
        let version = self.version().await?;
        if let Some(index) = self.index.read().as_ref() {
            if index.version == version {
                return Ok(index.clone());
            }
        }

        let entries = self
            .kv
            .scan_prefix(PARTITION_PREFIX)
            .await
            .map_err(unavailable)?;
        let partitions = entries
            .iter()
            .map(|(key, bytes)| kv::decode::<Partition>(key, bytes))
            .collect::<Result<Vec<_>>>()
            .map_err(Error::into_map_error)?;

        let index = Arc::new(MapIndex::build(version, partitions));
        tracing::debug!(
            version,
            partitions = index.partitions.len(),
            "Reloaded partition map"
        );
        *self.index.write() = Some(index.clone());
        Ok(index)
    }

    fn invalidate(&self) {
        *self.index.write() = None;
    }

    async fn publish(&self) -> Result<()> {
        self.invalidate();
        self.kv.incr(VERSION_KEY, 1).await.map_err(unavailable)?;
        Ok(())
    }

    /// Read a partition straight from the store.
    pub async fn get(&self, id: PartitionId) -> Result<Partition> {
        let key = partition_key(id);
        kv::get_decoded::<Partition>(self.kv.as_ref(), &key)
            .await
            .map_err(Error::into_map_error)?
            .ok_or(Error::PartitionNotFound(id))
    }

    /// All partitions, including retired ones, ordered by range start.
    pub async fn partitions(&self) -> Result<Vec<Partition>> {
        let index = self.snapshot().await?;
        let mut all: Vec<Partition> = index.partitions.values().cloned().collect();
        all.sort_by_key(|p| (p.range.start, p.created_at_ms));
        Ok(all)
    }

    /// The partition owning `key`, without creating one.
    pub async fn lookup(&self, key: Key) -> Result<Option<Partition>> {
        Ok(self.snapshot().await?.owner(key).cloned())
    }

    /// The partition owning `key`, creating one if the key was never routed.
    pub async fn resolve(&self, key: Key) -> Result<Partition> {
        if let Some(partition) = self.lookup(key).await? {
            return Ok(partition);
        }

        let locks = self.acquire_creation_locks(key).await?;
        let result = self.create_locked(key).await;
        for lease in &locks {
            if let Err(e) = self.kv.release_lease(lease).await {
                tracing::warn!(lease = %lease.name, error = %e, "Failed to release creation lock");
            }
        }
        result
    }

    /// Creation lock buckets for a partition starting at `key`.
    ///
    /// A new range spans at most two aligned blocks of `default_span` keys,
    /// and any two overlapping candidate ranges share a block, so locking
    /// both blocks serializes every creation that could overlap.
    fn creation_buckets(&self, key: Key) -> Vec<u32> {
        let span = self.default_span;
        let mut buckets: Vec<u32> = [key / span, key.saturating_add(span - 1) / span]
            .into_iter()
            .map(|block| {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write_u64(block);
                (hasher.finish() % self.lock_buckets as u64) as u32
            })
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        buckets
    }

    async fn acquire_creation_locks(&self, key: Key) -> Result<Vec<Lease>> {
        let cancel = CancellationToken::new();
        let mut held = Vec::new();
        for bucket in self.creation_buckets(key) {
            let name = creation_lock_name(bucket);
            match kv::acquire_blocking(
                self.kv.as_ref(),
                &name,
                &self.holder,
                CREATION_LOCK_TTL,
                self.lock_timeout,
                &cancel,
            )
            .await
            {
                Ok(lease) => held.push(lease),
                Err(e) => {
                    for lease in &held {
                        let _ = self.kv.release_lease(lease).await;
                    }
                    return Err(match e {
                        Error::LeaseTimeout(name) => Error::MapUnavailable(format!(
                            "creation lock {} not acquired within {:?}",
                            name, self.lock_timeout
                        )),
                        other => other.into_map_error(),
                    });
                }
            }
        }
        Ok(held)
    }

    async fn create_locked(&self, key: Key) -> Result<Partition> {
        self.invalidate();
        let index = self.snapshot().await?;
        if let Some(existing) = index.owner(key) {
            return Ok(existing.clone());
        }

        let mut range = KeyRange::with_span(key, self.default_span);
        if let Some(next) = index.next_start_after(key) {
            if next <= range.end {
                range.end = next - 1;
            }
        }

        let id = PartitionId::new();
        let (primary, replicas) = self
            .placement
            .assign(id)
            .ok_or_else(|| Error::Config("no store nodes configured".into()))?;
        let partition = Partition::new(id, range, primary, replicas);

        self.provision_all(&partition).await?;
        if let Err(e) = self.insert_record(&partition).await {
            self.deprovision_all(&partition).await;
            return Err(e);
        }

        if let Some(metrics) = &self.metrics {
            metrics.partitions_created.inc();
        }
        tracing::info!(
            partition_id = %id,
            range = %range,
            primary = %partition.primary,
            replicas = partition.replicas.len(),
            "Created partition"
        );
        Ok(partition)
    }

    /// Provision every copy, rolling all of them back if any fails.
    async fn provision_all(&self, partition: &Partition) -> Result<()> {
        for location in partition.locations() {
            if let Err(e) = self.store.provision(location).await {
                tracing::warn!(
                    partition_id = %partition.id,
                    location = %location,
                    error = %e,
                    "Provisioning failed, rolling back"
                );
                self.deprovision_all(partition).await;
                return Err(Error::Provisioning {
                    location: location.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn deprovision_all(&self, partition: &Partition) {
        for location in partition.locations() {
            if let Err(e) = self.store.deprovision(location).await {
                tracing::warn!(location = %location, error = %e, "Failed to deprovision");
            }
        }
    }

    async fn insert_record(&self, partition: &Partition) -> Result<()> {
        let bytes = kv::encode(partition)?;
        let inserted = self
            .kv
            .compare_and_set(&partition_key(partition.id), None, bytes)
            .await
            .map_err(unavailable)?;
        if !inserted {
            return Err(Error::Internal(format!(
                "partition {} already registered",
                partition.id
            )));
        }
        self.publish().await
    }

    /// Apply `f` to a partition record with a compare-and-set.
    ///
    /// With `expected_version` the mutation is rejected if the record moved
    /// past that version. Without it, lost races are retried on the fresh
    /// record, so `f` must check its own preconditions.
    pub async fn update<F>(
        &self,
        id: PartitionId,
        expected_version: Option<u64>,
        f: F,
    ) -> Result<Partition>
    where
        F: Fn(&mut Partition) -> Result<()> + Send + Sync,
    {
        let key = partition_key(id);
        let attempts = if expected_version.is_some() {
            1
        } else {
            MAX_CAS_ATTEMPTS
        };

        let mut seen = 0;
        for _ in 0..attempts {
            let raw = self
                .kv
                .get(&key)
                .await
                .map_err(unavailable)?
                .ok_or(Error::PartitionNotFound(id))?;
            let mut partition: Partition =
                kv::decode(&key, &raw).map_err(Error::into_map_error)?;
            if let Some(expected) = expected_version {
                if partition.version != expected {
                    return Err(Error::VersionConflict {
                        partition_id: id,
                        expected,
                        actual: partition.version,
                    });
                }
            }
            seen = partition.version;

            f(&mut partition)?;
            partition.version = seen + 1;

            let bytes = kv::encode(&partition)?;
            if self
                .kv
                .compare_and_set(&key, Some(&raw), bytes)
                .await
                .map_err(unavailable)?
            {
                self.publish().await?;
                return Ok(partition);
            }
            tracing::debug!(partition_id = %id, version = seen, "Partition record moved, retrying");
        }

        let actual = self.get(id).await.map(|p| p.version).unwrap_or(seen);
        Err(Error::VersionConflict {
            partition_id: id,
            expected: seen,
            actual,
        })
    }

    /// Change a partition's range.
    pub async fn update_range(
        &self,
        id: PartitionId,
        expected_version: u64,
        range: KeyRange,
    ) -> Result<Partition> {
        self.update(id, Some(expected_version), |p| {
            p.range = range;
            Ok(())
        })
        .await
    }

    /// Change a partition's lifecycle state.
    pub async fn set_status(
        &self,
        id: PartitionId,
        expected_version: u64,
        status: PartitionStatus,
    ) -> Result<Partition> {
        self.update(id, Some(expected_version), |p| {
            p.status = status;
            Ok(())
        })
        .await
    }

    /// Replace the primary and replica set.
    pub async fn set_roles(
        &self,
        id: PartitionId,
        expected_version: u64,
        primary: Location,
        replicas: Vec<Location>,
    ) -> Result<Partition> {
        if replicas.contains(&primary) {
            return Err(Error::Internal(format!(
                "primary {} listed as replica of {}",
                primary, id
            )));
        }
        self.update(id, Some(expected_version), |p| {
            p.primary = primary.clone();
            p.replicas = replicas.clone();
            let replicas = &p.replicas;
            p.lagging.retain(|l| replicas.contains(&l.location));
            Ok(())
        })
        .await
    }

    /// Promote `new_primary` in one atomic swap.
    ///
    /// The replica leaves the replica list, the old primary is appended to
    /// it as a lagging replica, and the failover time is recorded.
    pub async fn swap_primary(
        &self,
        id: PartitionId,
        expected_version: u64,
        new_primary: &Location,
    ) -> Result<Partition> {
        self.update(id, Some(expected_version), |p| {
            let position = p
                .replicas
                .iter()
                .position(|r| r == new_primary)
                .ok_or_else(|| {
                    Error::Internal(format!("{} is not a replica of {}", new_primary, p.id))
                })?;
            let now = now_ms();
            let promoted = p.replicas.remove(position);
            let demoted = std::mem::replace(&mut p.primary, promoted);
            p.lagging.retain(|l| &l.location != new_primary);
            p.lagging.push(ReplicaLag {
                location: demoted.clone(),
                since_ms: now,
                missed: 0,
            });
            p.replicas.push(demoted);
            p.last_failover_at_ms = Some(now);
            Ok(())
        })
        .await
    }

    /// Record that a replica missed a write.
    ///
    /// The first miss starts the mark; later ones bump its `missed` count.
    pub async fn mark_lagging(&self, id: PartitionId, location: &Location) -> Result<()> {
        let current = self.get(id).await?;
        if !current.replicas.contains(location) {
            return Ok(());
        }
        let updated = self
            .update(id, None, |p| {
                if !p.replicas.contains(location) {
                    return Ok(());
                }
                match p.lagging.iter_mut().find(|l| &l.location == location) {
                    Some(lag) => lag.missed += 1,
                    None => p.lagging.push(ReplicaLag {
                        location: location.clone(),
                        since_ms: now_ms(),
                        missed: 1,
                    }),
                }
                Ok(())
            })
            .await?;
        if !current.is_lagging(location) {
            tracing::warn!(partition_id = %id, location = %location, "Replica marked lagging");
        } else {
            tracing::debug!(
                partition_id = %id,
                location = %location,
                missed = updated.lag_of(location).map_or(0, |l| l.missed),
                "Lagging replica missed another write"
            );
        }
        Ok(())
    }

    /// Clear a replica's lagging mark unconditionally.
    pub async fn clear_lagging(&self, id: PartitionId, location: &Location) -> Result<()> {
        if !self.get(id).await?.is_lagging(location) {
            return Ok(());
        }
        self.update(id, None, |p| {
            p.lagging.retain(|l| &l.location != location);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Clear a replica's lagging mark only if it is still exactly `seen`
    /// (`None`: the replica was in sync when the caller looked).
    ///
    /// Returns whether the replica ends in sync. A mark that appeared or
    /// moved in the meantime means a write was missed after `seen` was
    /// taken, and is kept.
    pub async fn clear_lagging_if(
        &self,
        id: PartitionId,
        location: &Location,
        seen: Option<&ReplicaLag>,
    ) -> Result<bool> {
        let current = self.get(id).await?;
        if current.lag_of(location) != seen {
            return Ok(false);
        }
        if seen.is_none() {
            return Ok(true);
        }
        let unchanged = AtomicBool::new(false);
        self.update(id, None, |p| {
            let still = p.lag_of(location) == seen;
            unchanged.store(still, Ordering::SeqCst);
            if still {
                p.lagging.retain(|l| &l.location != location);
            }
            Ok(())
        })
        .await?;
        Ok(unchanged.load(Ordering::SeqCst))
    }

    /// Store a reconciled record count.
    pub async fn set_record_count(&self, id: PartitionId, count: u64) -> Result<()> {
        if self.get(id).await?.record_count == count {
            return Ok(());
        }
        self.update(id, None, |p| {
            p.record_count = count;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Register and provision the child of a split covering `(pivot, end]`.
    pub async fn create_split_child(&self, parent: &Partition, pivot: Key) -> Result<Partition> {
        let (_, upper) = parent.range.split_at(pivot).ok_or_else(|| {
            Error::Internal(format!("pivot {} outside {}", pivot, parent.range))
        })?;

        let id = PartitionId::new();
        let (primary, replicas) = self
            .placement
            .assign(id)
            .ok_or_else(|| Error::Config("no store nodes configured".into()))?;
        let mut child = Partition::new(id, upper, primary, replicas);
        child.status = PartitionStatus::Splitting;
        child.split = Some(SplitRole::Child { parent: parent.id });

        self.provision_all(&child).await?;
        if let Err(e) = self.insert_record(&child).await {
            self.deprovision_all(&child).await;
            return Err(e);
        }
        Ok(child)
    }

    /// Mark `parent` splitting, redirecting keys above `pivot` to `child`.
    pub async fn begin_split(
        &self,
        parent: &Partition,
        child: PartitionId,
        pivot: Key,
    ) -> Result<Partition> {
        self.update(parent.id, Some(parent.version), |p| {
            if p.status != PartitionStatus::Active || p.split.is_some() {
                return Err(Error::Internal(format!(
                    "partition {} is {} and cannot start a split",
                    p.id, p.status
                )));
            }
            p.status = PartitionStatus::Splitting;
            p.split = Some(SplitRole::Parent { child, pivot });
            Ok(())
        })
        .await
    }

    /// Commit a split: activate the child, then shrink the parent.
    ///
    /// Safe to call again after a partial commit.
    pub async fn commit_split(
        &self,
        parent_id: PartitionId,
        child_id: PartitionId,
        parent_count: u64,
        child_count: u64,
    ) -> Result<(Partition, Partition)> {
        let child = self
            .update(child_id, None, |c| {
                match (c.status, c.split) {
                    (PartitionStatus::Splitting, Some(SplitRole::Child { parent }))
                        if parent == parent_id => {}
                    (PartitionStatus::Active, None) => {}
                    _ => {
                        return Err(Error::Internal(format!(
                            "partition {} is not the split child of {}",
                            c.id, parent_id
                        )))
                    }
                }
                c.status = PartitionStatus::Active;
                c.split = None;
                c.record_count = child_count;
                Ok(())
            })
            .await?;

        let parent = self
            .update(parent_id, None, |p| {
                let (child, pivot) = p.split_plan().ok_or_else(|| {
                    Error::Internal(format!("partition {} has no split in flight", p.id))
                })?;
                if child != child_id {
                    return Err(Error::Internal(format!(
                        "partition {} is splitting into {}, not {}",
                        p.id, child, child_id
                    )));
                }
                p.range.end = pivot;
                p.status = PartitionStatus::Active;
                p.split = None;
                p.record_count = parent_count;
                Ok(())
            })
            .await?;

        Ok((parent, child))
    }

    /// Drop an in-flight split plan, returning the parent to its full range.
    pub async fn cancel_split(&self, parent_id: PartitionId) -> Result<Partition> {
        self.update(parent_id, None, |p| {
            if p.split_plan().is_none() {
                return Err(Error::Internal(format!(
                    "partition {} has no split in flight",
                    p.id
                )));
            }
            p.status = PartitionStatus::Active;
            p.split = None;
            Ok(())
        })
        .await
    }

    /// Retire a partition and release its storage.
    pub async fn retire(&self, id: PartitionId) -> Result<Partition> {
        let retired = self
            .update(id, None, |p| {
                p.status = PartitionStatus::Retired;
                p.split = None;
                Ok(())
            })
            .await?;
        self.deprovision_all(&retired).await;
        tracing::info!(partition_id = %id, range = %retired.range, "Retired partition");
        Ok(retired)
    }
}
