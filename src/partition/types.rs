//! Partition metadata types.

use crate::types::{now_ms, Key, Location};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque unique partition identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(Uuid);

impl PartitionId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Name of the table holding this partition's rows on every node.
    pub fn table_name(&self) -> String {
        format!("p_{}", self.0.simple())
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PartitionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Inclusive key range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// First key (inclusive).
    pub start: Key,
    /// Last key (inclusive).
    pub end: Key,
}

impl KeyRange {
    /// Create a range. `start` must not exceed `end`.
    pub fn new(start: Key, end: Key) -> Self {
        debug_assert!(start <= end, "inverted key range");
        Self { start, end }
    }

    /// The range `[start, start + span)`, saturating at the top of the domain.
    pub fn with_span(start: Key, span: u64) -> Self {
        Self::new(start, start.saturating_add(span.max(1) - 1))
    }

    /// Check if a key falls inside the range.
    pub fn contains(&self, key: Key) -> bool {
        self.start <= key && key <= self.end
    }

    /// Check if two ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Number of keys in the range, saturating for the full domain.
    pub fn width(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Split into `[start, pivot]` and `[pivot + 1, end]`.
    ///
    /// Returns `None` if either side would be empty.
    pub fn split_at(&self, pivot: Key) -> Option<(KeyRange, KeyRange)> {
        if pivot < self.start || pivot >= self.end {
            return None;
        }
        Some((
            KeyRange::new(self.start, pivot),
            KeyRange::new(pivot + 1, self.end),
        ))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Lifecycle state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Serving reads and writes for its whole range.
    Active,
    /// Part of an in-flight split.
    Splitting,
    /// No longer owns any keys.
    Retired,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStatus::Active => write!(f, "active"),
            PartitionStatus::Splitting => write!(f, "splitting"),
            PartitionStatus::Retired => write!(f, "retired"),
        }
    }
}

/// Role of a partition in an in-flight split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitRole {
    /// The partition being split. Keys above `pivot` belong to `child`.
    Parent { child: PartitionId, pivot: Key },
    /// The partition receiving `(pivot, end]` of `parent`.
    Child { parent: PartitionId },
}

/// A replica that missed writes mirrored from the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLag {
    /// The lagging replica.
    pub location: Location,
    /// When the first unmirrored write happened (Unix ms).
    pub since_ms: u64,
    /// Writes missed since `since_ms`. Bumped on every further miss, so a
    /// repair can tell whether the mark moved while it ran.
    #[serde(default)]
    pub missed: u64,
}

/// The unit of sharding: a contiguous key range with its own storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Unique identifier.
    pub id: PartitionId,
    /// Owned key range.
    pub range: KeyRange,
    /// Current writable copy.
    pub primary: Location,
    /// Read-capable copies in promotion priority order.
    pub replicas: Vec<Location>,
    /// Replicas known to be behind the primary.
    pub lagging: Vec<ReplicaLag>,
    /// Lifecycle state.
    pub status: PartitionStatus,
    /// Approximate number of records, reconciled by the monitor.
    pub record_count: u64,
    /// Time of the most recent promotion (Unix ms).
    pub last_failover_at_ms: Option<u64>,
    /// Split bookkeeping while a split is in flight.
    pub split: Option<SplitRole>,
    /// Bumped on every mutation; used for optimistic concurrency.
    pub version: u64,
    /// Creation time (Unix ms).
    pub created_at_ms: u64,
}

impl Partition {
    /// Create an active partition.
    pub fn new(id: PartitionId, range: KeyRange, primary: Location, replicas: Vec<Location>) -> Self {
        Self {
            id,
            range,
            primary,
            replicas,
            lagging: Vec::new(),
            status: PartitionStatus::Active,
            record_count: 0,
            last_failover_at_ms: None,
            split: None,
            version: 1,
            created_at_ms: now_ms(),
        }
    }

    /// Primary followed by replicas.
    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    /// Check if the partition is active.
    pub fn is_active(&self) -> bool {
        self.status == PartitionStatus::Active
    }

    /// Child and pivot if this partition is the parent of an in-flight split.
    pub fn split_plan(&self) -> Option<(PartitionId, Key)> {
        match self.split {
            Some(SplitRole::Parent { child, pivot }) => Some((child, pivot)),
            _ => None,
        }
    }

    /// Parent if this partition is the child of an in-flight split.
    pub fn split_parent(&self) -> Option<PartitionId> {
        match self.split {
            Some(SplitRole::Child { parent }) => Some(parent),
            _ => None,
        }
    }

    /// Whether keys of this partition can be routed to it directly.
    ///
    /// Split children receive traffic only through their parent's plan until
    /// the split commits.
    pub fn is_routable(&self) -> bool {
        match self.status {
            PartitionStatus::Active => true,
            PartitionStatus::Splitting => self.split_parent().is_none(),
            PartitionStatus::Retired => false,
        }
    }

    /// Check if a replica is marked lagging.
    pub fn is_lagging(&self, location: &Location) -> bool {
        self.lag_of(location).is_some()
    }

    /// The lagging mark of `location`, if any.
    pub fn lag_of(&self, location: &Location) -> Option<&ReplicaLag> {
        self.lagging.iter().find(|l| &l.location == location)
    }

    /// How far behind a replica is, zero if caught up.
    pub fn lag_ms(&self, location: &Location, now_ms: u64) -> u64 {
        self.lagging
            .iter()
            .find(|l| &l.location == location)
            .map_or(0, |l| now_ms.saturating_sub(l.since_ms))
    }

    /// Replicas that are not lagging, in priority order.
    pub fn in_sync_replicas(&self) -> Vec<Location> {
        self.replicas
            .iter()
            .filter(|r| !self.is_lagging(r))
            .cloned()
            .collect()
    }
}
