//! Configuration types for the partition router.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Width of the range given to a partition created for an unseen key.
    pub default_span: u64,

    /// Partition placement over store nodes.
    pub placement: PlacementConfig,

    /// Write batching configuration.
    pub batch: BatchConfig,

    /// Health probing and promotion configuration.
    pub failover: FailoverConfig,

    /// Split configuration.
    pub split: SplitConfig,

    /// How long a request status snapshot stays queryable.
    pub request_status_ttl: Duration,

    /// Number of named creation locks keys are hashed onto.
    pub creation_lock_buckets: u32,

    /// How long partition creation waits for its creation lock.
    pub creation_lock_timeout: Duration,

    /// Interval between monitor passes.
    pub monitor_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_span: 1_000_000,
            placement: PlacementConfig::default(),
            batch: BatchConfig::default(),
            failover: FailoverConfig::default(),
            split: SplitConfig::default(),
            request_status_ttl: Duration::from_secs(3600), // 1 hour
            creation_lock_buckets: 1024,
            creation_lock_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl RouterConfig {
    /// Create a configuration placing partitions on the given store nodes.
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            placement: PlacementConfig::new(nodes),
            ..Default::default()
        }
    }

    /// Set the default partition span.
    pub fn with_default_span(mut self, span: u64) -> Self {
        self.default_span = span;
        self
    }

    /// Set the number of replicas kept per partition.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.placement.replicas_per_partition = replicas;
        self
    }

    /// Set the batch configuration.
    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch.batch_size = batch_size;
        self
    }

    /// Set the failover configuration.
    pub fn with_failover_config(mut self, failover: FailoverConfig) -> Self {
        self.failover = failover;
        self
    }

    /// Set the split configuration.
    pub fn with_split_config(mut self, split: SplitConfig) -> Self {
        self.split = split;
        self
    }

    /// Set the split threshold.
    pub fn with_max_shard_size(mut self, max: u64) -> Self {
        self.split.max_shard_size = max;
        self
    }

    /// Set the request status TTL.
    pub fn with_request_status_ttl(mut self, ttl: Duration) -> Self {
        self.request_status_ttl = ttl;
        self
    }

    /// Set the monitor interval.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Check the configuration for values the router cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_span == 0 {
            return Err(Error::Config("default_span must be positive".into()));
        }
        if self.creation_lock_buckets == 0 {
            return Err(Error::Config("creation_lock_buckets must be positive".into()));
        }
        self.placement.validate()?;
        self.batch.validate()?;
        self.split.validate()?;
        if self.failover.probe_attempts == 0 {
            return Err(Error::Config("probe_attempts must be positive".into()));
        }
        if self.failover.promotion_timeout.is_zero() {
            return Err(Error::Config("promotion_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Placement of partition copies over store nodes.
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Store nodes available for partition storage.
    pub nodes: Vec<String>,

    /// Replicas per partition, in addition to the primary.
    pub replicas_per_partition: usize,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["node-0".to_string(), "node-1".to_string()],
            replicas_per_partition: 1,
        }
    }
}

impl PlacementConfig {
    /// Create a placement over the given nodes.
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Number of copies (primary plus replicas) of every partition.
    pub fn copies(&self) -> usize {
        1 + self.replicas_per_partition
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.len() < self.copies() {
            return Err(Error::Config(format!(
                "need at least {} store nodes for {} replicas, have {}",
                self.copies(),
                self.replicas_per_partition,
                self.nodes.len()
            )));
        }
        let mut sorted = self.nodes.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.nodes.len() {
            return Err(Error::Config("store node names must be unique".into()));
        }
        Ok(())
    }
}

/// Write batching configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Queue depth that triggers a drain, and the maximum entries per drain.
    pub batch_size: usize,

    /// Lease duration held by a drainer.
    pub drain_lease_ttl: Duration,

    /// Attempts per queue entry before it is dead-lettered.
    pub max_insert_attempts: u32,

    /// Backoff after the first failed attempt. Doubles per attempt.
    pub retry_base_backoff: Duration,

    /// Upper bound for the retry backoff.
    pub retry_max_backoff: Duration,

    /// Queues whose oldest entry is older than this are drained by the
    /// monitor even below `batch_size`.
    pub stale_queue_age: Duration,

    /// Timeout for a single store call made by a drain.
    pub store_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            drain_lease_ttl: Duration::from_secs(30),
            max_insert_attempts: 3,
            retry_base_backoff: Duration::from_millis(50),
            retry_max_backoff: Duration::from_secs(2),
            stale_queue_age: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    /// Create a batch config with the given batch size.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    /// Set the retry policy.
    pub fn with_retries(mut self, attempts: u32, base_backoff: Duration) -> Self {
        self.max_insert_attempts = attempts;
        self.retry_base_backoff = base_backoff;
        self
    }

    /// Set the staleness bound for monitor sweeps.
    pub fn with_stale_queue_age(mut self, age: Duration) -> Self {
        self.stale_queue_age = age;
        self
    }

    /// Backoff to wait before attempt number `attempt + 1`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_backoff
            .saturating_mul(factor)
            .min(self.retry_max_backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.max_insert_attempts == 0 {
            return Err(Error::Config("max_insert_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Health probing and promotion configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// A successful probe younger than this counts as healthy.
    pub health_freshness: Duration,

    /// Timeout of a single probe.
    pub probe_timeout: Duration,

    /// Probe attempts before a location is declared down.
    pub probe_attempts: u32,

    /// Backoff between probe attempts. Doubles per attempt.
    pub probe_backoff: Duration,

    /// Oldest unmirrored write a replica may have and still be promoted.
    /// Zero admits only fully caught-up replicas.
    pub max_promotion_lag: Duration,

    /// Longest a caller waits for a promotion, including the wait behind
    /// another promotion of the same partition.
    pub promotion_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_freshness: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(250),
            probe_attempts: 3,
            probe_backoff: Duration::from_millis(20),
            max_promotion_lag: Duration::ZERO,
            promotion_timeout: Duration::from_secs(10),
        }
    }
}

impl FailoverConfig {
    /// Set the health freshness window.
    pub fn with_health_freshness(mut self, freshness: Duration) -> Self {
        self.health_freshness = freshness;
        self
    }

    /// Set probe timeout and attempts.
    pub fn with_probe(mut self, timeout: Duration, attempts: u32) -> Self {
        self.probe_timeout = timeout;
        self.probe_attempts = attempts;
        self
    }

    /// Set the promotion timeout.
    pub fn with_promotion_timeout(mut self, timeout: Duration) -> Self {
        self.promotion_timeout = timeout;
        self
    }

    /// Set the promotion lag bound.
    pub fn with_max_promotion_lag(mut self, lag: Duration) -> Self {
        self.max_promotion_lag = lag;
        self
    }
}

/// Shard split configuration.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Record count at which a partition is split.
    pub max_shard_size: u64,

    /// Records copied per migration chunk.
    pub migration_chunk_size: usize,

    /// How long a split waits for the partition lease.
    pub lease_timeout: Duration,

    /// Lease duration held by a running split.
    pub lease_ttl: Duration,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_shard_size: 100_000,
            migration_chunk_size: 500,
            lease_timeout: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(120),
        }
    }
}

impl SplitConfig {
    /// Create a split config with the given threshold.
    pub fn new(max_shard_size: u64) -> Self {
        Self {
            max_shard_size,
            ..Default::default()
        }
    }

    /// Set the migration chunk size.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.migration_chunk_size = chunk;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_shard_size < 2 {
            return Err(Error::Config("max_shard_size must be at least 2".into()));
        }
        if self.migration_chunk_size == 0 {
            return Err(Error::Config("migration_chunk_size must be positive".into()));
        }
        Ok(())
    }
}
