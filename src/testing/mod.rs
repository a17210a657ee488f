//! Testing utilities for the router.
//!
//! [`TestHarness`] wires a [`Router`] and a [`Monitor`] over in-memory
//! collaborators with small thresholds, and exposes the fault injection of
//! [`MemoryStore`] and [`MemoryKv`] by node index.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 TestHarness                  │
//! │   Router ──▶ MemoryKv     (set_available)    │
//! │     │    ──▶ MemoryStore  (node down, slow,  │
//! │     │                      failing inserts)  │
//! │   Monitor                                    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The suites in this module exercise the properties that only show up when
//! the components run together: partition coverage, one drain at a time,
//! no write loss across failover, and split correctness.

mod batch_tests;
mod failover_tests;
mod routing_tests;
mod split_tests;

use crate::config::{BatchConfig, FailoverConfig, RouterConfig, SplitConfig};
use crate::kv::MemoryKv;
use crate::monitor::Monitor;
use crate::partition::{Partition, PartitionStatus};
use crate::router::Router;
use crate::store::MemoryStore;
use crate::types::RequestId;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A router over in-memory collaborators.
#[derive(Debug)]
pub struct TestHarness {
    /// Metadata store.
    pub kv: Arc<MemoryKv>,
    /// Partition storage.
    pub store: Arc<MemoryStore>,
    /// The router under test.
    pub router: Arc<Router>,
    /// Monitor over the router.
    pub monitor: Arc<Monitor>,
}

impl TestHarness {
    /// Harness over `nodes` store nodes with [`TestHarness::config`].
    pub fn new(nodes: usize) -> Self {
        Self::with_config(Self::config(nodes))
    }

    /// Harness with a custom configuration.
    pub fn with_config(config: RouterConfig) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(MemoryStore::new());
        let router = Router::new(kv.clone(), store.clone(), config)
            .unwrap_or_else(|e| panic!("invalid test config: {}", e));
        let monitor = Arc::new(Monitor::new(router.clone()));
        Self {
            kv,
            store,
            router,
            monitor,
        }
    }

    /// Small thresholds and fast timeouts: one replica, batches of 4, splits
    /// at 100 records, millisecond retry backoff.
    pub fn config(nodes: usize) -> RouterConfig {
        RouterConfig::new((0..nodes).map(Self::node).collect())
            .with_replicas(1)
            .with_batch_config(
                BatchConfig::new(4)
                    .with_retries(3, Duration::from_millis(1))
                    .with_stale_queue_age(Duration::from_millis(50)),
            )
            .with_failover_config(
                FailoverConfig::default()
                    .with_health_freshness(Duration::from_secs(1))
                    .with_probe(Duration::from_millis(50), 1),
            )
            .with_split_config(SplitConfig {
                lease_timeout: Duration::from_secs(2),
                ..SplitConfig::new(100).with_chunk_size(8)
            })
            .with_monitor_interval(Duration::from_millis(20))
    }

    /// Name of the store node with index `i`.
    pub fn node(i: usize) -> String {
        format!("node-{}", i)
    }

    /// Submit a write and wait until every queue is drained.
    pub async fn write_and_flush(&self, key: u64, payload: &str) -> RequestId {
        let id = self
            .router
            .submit_write(key, payload.as_bytes().to_vec())
            .await
            .unwrap_or_else(|e| panic!("submit {} failed: {}", key, e));
        self.flush().await;
        id
    }

    /// Drain every queue.
    pub async fn flush(&self) -> usize {
        self.router
            .flush()
            .await
            .unwrap_or_else(|e| panic!("flush failed: {}", e))
    }

    /// Partitions that are not retired, ordered by range start.
    pub async fn live_partitions(&self) -> Vec<Partition> {
        self.router
            .map()
            .partitions()
            .await
            .unwrap_or_else(|e| panic!("map unreadable: {}", e))
            .into_iter()
            .filter(|p| p.status != PartitionStatus::Retired)
            .collect()
    }

    /// Take a store node down.
    pub fn kill_node(&self, node: &str) {
        self.store.set_node_down(node, true);
    }

    /// Bring a store node back.
    pub fn revive_node(&self, node: &str) {
        self.store.set_node_down(node, false);
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
