//! Dynamic key-range sharding and replication router.
//!
//! This crate routes single-key writes and reads over a set of partitions,
//! each owning a contiguous range of `u64` keys and stored as a primary copy
//! plus replicas on external store nodes. It provides:
//! - **Partition map** kept in a shared key-value store with versioned updates
//! - **Write batching** through durable per-partition queues and a lease per drainer
//! - **Replica failover** with health probes, promotion and repair
//! - **Shard splitting** at the median key once a partition grows too large
//!
//! # Example
//!
//! ```rust,no_run
//! use shardmap::{MemoryKv, MemoryStore, Router, RouterConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::new(vec!["node-0".into(), "node-1".into()])
//!         .with_batch_size(100)
//!         .with_max_shard_size(100_000);
//!     let router = Router::new(Arc::new(MemoryKv::new()), Arc::new(MemoryStore::new()), config)?;
//!
//!     // Writes are queued and persisted asynchronously
//!     let request = router.submit_write(42, &b"payload"[..]).await?;
//!     router.flush().await?;
//!     println!("{:?}", router.get_request_status(request).await?.status);
//!
//!     // Reads go to an in-sync replica, or the primary
//!     let record = router.read_by_key(42).await?;
//!     println!("key {} seq {}", record.key, record.seq);
//!
//!     router.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Validation layer               │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                  Router                     │
//! │  • submit_write(key, payload) -> RequestId  │
//! │  • read_by_key(key) -> Record               │
//! │  • get_request_status(id) -> Snapshot       │
//! └─────────────────────────────────────────────┘
//!          │            │             │
//!          ▼            ▼             ▼
//!   ┌───────────┐ ┌───────────┐ ┌───────────┐      ┌─────────┐
//!   │ Partition │ │   Write   │ │  Shard    │ ◀─── │ Monitor │
//!   │    Map    │ │   Queue   │ │ Splitter  │      └─────────┘
//!   └───────────┘ └───────────┘ └───────────┘
//!          │            │             │
//!          ▼            ▼             ▼
//!   ┌─────────────────────────────────────────┐
//!   │  FailoverManager  (probe, promote, repair) │
//!   └─────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//!   KeyValueStore              PartitionStore
//!   (map, queues, leases)      (primary and replica tables)
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: at-least-once into the owning primary, last writer wins on `seq`
//! - **Reads**: from in-sync copies only, so a lagging replica is never read
//! - **Ownership**: every routed key has exactly one owner, including mid-split

pub mod batch;
pub mod config;
pub mod error;
pub mod failover;
pub mod kv;
pub mod metrics;
pub mod monitor;
pub mod partition;
pub mod router;
pub mod split;
pub mod status;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{BatchConfig, FailoverConfig, PlacementConfig, RouterConfig, SplitConfig};
pub use error::{Error, KvError, Result, StoreError};
pub use router::Router;
pub use types::{Key, Location, Record, RecordId, RequestId};

// Re-export collaborator interfaces and their in-memory implementations
pub use kv::{KeyValueStore, Lease, MemoryKv};
pub use store::{MemoryStore, PartitionStore};

// Re-export component types
pub use batch::{BatchEntry, DeadLetter, DrainOutcome, DrainReport, WriteBatchQueue};
pub use failover::{FailoverManager, FailoverState, HealthStatus, PartitionHealth};
pub use monitor::{Monitor, MonitorReport};
pub use partition::{KeyRange, Partition, PartitionId, PartitionMap, PartitionStatus, SplitRole};
pub use split::{RecoveryAction, ShardSplitter, SplitOutcome, SplitReport};
pub use status::{RequestSnapshot, RequestStatus, RequestStatusStore};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, MetricsSnapshot, RouterMetrics};

// Re-export testing types
pub use testing::TestHarness;
