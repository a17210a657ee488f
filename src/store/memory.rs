//! In-memory partition store with fault injection.

use super::{PartitionStore, StoreResult};
use crate::error::StoreError;
use crate::types::{Key, Location, Record, RecordId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Default)]
struct NodeState {
    tables: HashMap<String, BTreeMap<Key, Record>>,
    down: bool,
    fail_provision: bool,
    failing_inserts: u32,
    latency: Option<Duration>,
    insert_calls: u64,
}

/// Store nodes held in memory, one ordered table per partition copy.
///
/// Nodes can be taken down, made slow, or made to fail a number of inserts,
/// which is how failover and retry paths are exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, NodeState>>,
}

impl MemoryStore {
    /// Create a store with no nodes. Nodes appear on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node as down (every operation fails) or up.
    pub fn set_node_down(&self, node: &str, down: bool) {
        self.nodes.write().entry(node.to_string()).or_default().down = down;
        tracing::debug!(node, down, "Store node availability changed");
    }

    /// Make provisioning on a node fail.
    pub fn set_fail_provision(&self, node: &str, fail: bool) {
        self.nodes
            .write()
            .entry(node.to_string())
            .or_default()
            .fail_provision = fail;
    }

    /// Make the next `n` inserts on a node fail with an I/O error.
    pub fn fail_next_inserts(&self, node: &str, n: u32) {
        self.nodes
            .write()
            .entry(node.to_string())
            .or_default()
            .failing_inserts = n;
    }

    /// Delay every operation on a node.
    pub fn set_latency(&self, node: &str, latency: Option<Duration>) {
        self.nodes.write().entry(node.to_string()).or_default().latency = latency;
    }

    /// Number of insert calls that reached a node (successful or not).
    pub fn insert_calls(&self, node: &str) -> u64 {
        self.nodes.read().get(node).map_or(0, |n| n.insert_calls)
    }

    /// Whether a table exists at the location.
    pub fn is_provisioned(&self, location: &Location) -> bool {
        self.nodes
            .read()
            .get(&location.node)
            .is_some_and(|n| n.tables.contains_key(&location.table))
    }

    /// Every key stored at a location, ignoring availability.
    pub fn keys_at(&self, location: &Location) -> Vec<Key> {
        self.nodes
            .read()
            .get(&location.node)
            .and_then(|n| n.tables.get(&location.table))
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn delay(&self, location: &Location) {
        let latency = self
            .nodes
            .read()
            .get(&location.node)
            .and_then(|n| n.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Run `f` against the table at `location` under the write lock.
    fn with_table_mut<T>(
        &self,
        location: &Location,
        f: impl FnOnce(&mut BTreeMap<Key, Record>) -> T,
    ) -> StoreResult<T> {
        let mut nodes = self.nodes.write();
        let node = nodes.entry(location.node.clone()).or_default();
        if node.down {
            return Err(StoreError::Unavailable(location.clone()));
        }
        let table = node
            .tables
            .get_mut(&location.table)
            .ok_or_else(|| StoreError::NotProvisioned(location.clone()))?;
        Ok(f(table))
    }

    fn with_table<T>(
        &self,
        location: &Location,
        f: impl FnOnce(&BTreeMap<Key, Record>) -> T,
    ) -> StoreResult<T> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(&location.node)
            .ok_or_else(|| StoreError::NotProvisioned(location.clone()))?;
        if node.down {
            return Err(StoreError::Unavailable(location.clone()));
        }
        let table = node
            .tables
            .get(&location.table)
            .ok_or_else(|| StoreError::NotProvisioned(location.clone()))?;
        Ok(f(table))
    }

    /// Consume one injected insert failure, if any are pending.
    fn take_insert_failure(&self, location: &Location) -> StoreResult<()> {
        let mut nodes = self.nodes.write();
        let node = nodes.entry(location.node.clone()).or_default();
        node.insert_calls += 1;
        if node.failing_inserts > 0 {
            node.failing_inserts -= 1;
            return Err(StoreError::Io {
                location: location.clone(),
                reason: "injected insert failure".into(),
            });
        }
        Ok(())
    }
}

/// Apply `record` unless a newer version of the key is already stored.
fn apply(table: &mut BTreeMap<Key, Record>, record: Record) -> bool {
    match table.get(&record.key) {
        Some(existing) if existing.seq >= record.seq => false,
        _ => {
            table.insert(record.key, record);
            true
        }
    }
}

#[async_trait]
impl PartitionStore for MemoryStore {
    async fn provision(&self, location: &Location) -> StoreResult<()> {
        self.delay(location).await;
        let mut nodes = self.nodes.write();
        let node = nodes.entry(location.node.clone()).or_default();
        if node.down {
            return Err(StoreError::Unavailable(location.clone()));
        }
        if node.fail_provision {
            return Err(StoreError::Io {
                location: location.clone(),
                reason: "injected provisioning failure".into(),
            });
        }
        node.tables.entry(location.table.clone()).or_default();
        Ok(())
    }

    async fn deprovision(&self, location: &Location) -> StoreResult<()> {
        self.delay(location).await;
        let mut nodes = self.nodes.write();
        let node = nodes.entry(location.node.clone()).or_default();
        if node.down {
            return Err(StoreError::Unavailable(location.clone()));
        }
        node.tables.remove(&location.table);
        Ok(())
    }

    async fn insert(&self, location: &Location, record: Record) -> StoreResult<RecordId> {
        self.delay(location).await;
        self.take_insert_failure(location)?;
        let id = record.id();
        self.with_table_mut(location, |table| apply(table, record))?;
        Ok(id)
    }

    async fn insert_many(&self, location: &Location, records: Vec<Record>) -> StoreResult<usize> {
        self.delay(location).await;
        self.take_insert_failure(location)?;
        self.with_table_mut(location, |table| {
            records.into_iter().filter(|r| apply(table, r.clone())).count()
        })
    }

    async fn select_by_key(&self, location: &Location, key: Key) -> StoreResult<Option<Record>> {
        self.delay(location).await;
        self.with_table(location, |table| table.get(&key).cloned())
    }

    async fn count(&self, location: &Location) -> StoreResult<u64> {
        self.delay(location).await;
        self.with_table(location, |table| table.len() as u64)
    }

    async fn count_range(&self, location: &Location, start: Key, end: Key) -> StoreResult<u64> {
        if start > end {
            return Ok(0);
        }
        self.delay(location).await;
        self.with_table(location, |table| table.range(start..=end).count() as u64)
    }

    async fn nth_key(
        &self,
        location: &Location,
        start: Key,
        end: Key,
        n: u64,
    ) -> StoreResult<Option<Key>> {
        if start > end {
            return Ok(None);
        }
        self.delay(location).await;
        self.with_table(location, |table| {
            table.range(start..=end).nth(n as usize).map(|(k, _)| *k)
        })
    }

    async fn scan_range(
        &self,
        location: &Location,
        start: Key,
        end: Key,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.delay(location).await;
        self.with_table(location, |table| {
            table
                .range(start..=end)
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect()
        })
    }

    async fn delete_keys(&self, location: &Location, keys: &[Key]) -> StoreResult<usize> {
        self.delay(location).await;
        self.with_table_mut(location, |table| {
            keys.iter().filter(|k| table.remove(k).is_some()).count()
        })
    }

    async fn delete_range(&self, location: &Location, start: Key, end: Key) -> StoreResult<usize> {
        if start > end {
            return Ok(0);
        }
        self.delay(location).await;
        self.with_table_mut(location, |table| {
            let keys: Vec<Key> = table.range(start..=end).map(|(k, _)| *k).collect();
            for key in &keys {
                table.remove(key);
            }
            keys.len()
        })
    }

    async fn probe(&self, location: &Location) -> StoreResult<()> {
        self.delay(location).await;
        self.with_table(location, |_| ())
    }
}
