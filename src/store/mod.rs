//! Partition store adapter.
//!
//! Executes reads and writes against the physical storage of one partition
//! copy, addressed by [`Location`]. Every partition has the same physical
//! shape, so one adapter serves primaries and replicas alike. The adapter
//! never touches the partition map.
//!
//! Inserts are last-writer-wins on the record's `seq`: a record only replaces
//! a stored record with the same key if its sequence is higher. This makes
//! queue replays and resumed migrations safe to repeat.

mod memory;
mod migrate;

pub use memory::MemoryStore;
pub use migrate::{migrate_range, range_checksum, MigrationReport, RangeDigest};

use crate::error::StoreError;
use crate::types::{Key, Location, Record, RecordId};
use async_trait::async_trait;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations against the physical storage of a partition copy.
#[async_trait]
pub trait PartitionStore: Send + Sync + std::fmt::Debug {
    /// Create the physical structure at `location`. A no-op if it exists.
    async fn provision(&self, location: &Location) -> StoreResult<()>;

    /// Drop the physical structure at `location`. A no-op if it is absent.
    async fn deprovision(&self, location: &Location) -> StoreResult<()>;

    /// Store one record.
    async fn insert(&self, location: &Location, record: Record) -> StoreResult<RecordId>;

    /// Store a group of records in one transaction. Returns how many were
    /// applied (records older than the stored version are skipped).
    async fn insert_many(&self, location: &Location, records: Vec<Record>) -> StoreResult<usize>;

    /// Read the record stored under `key`.
    async fn select_by_key(&self, location: &Location, key: Key) -> StoreResult<Option<Record>>;

    /// Number of records at `location`.
    async fn count(&self, location: &Location) -> StoreResult<u64>;

    /// Number of records with keys in `[start, end]`.
    async fn count_range(&self, location: &Location, start: Key, end: Key) -> StoreResult<u64>;

    /// The `n`th smallest key in `[start, end]` (zero based), via an ordered
    /// index seek.
    async fn nth_key(
        &self,
        location: &Location,
        start: Key,
        end: Key,
        n: u64,
    ) -> StoreResult<Option<Key>>;

    /// Up to `limit` records with keys in `[start, end]`, ordered by key.
    async fn scan_range(
        &self,
        location: &Location,
        start: Key,
        end: Key,
        limit: usize,
    ) -> StoreResult<Vec<Record>>;

    /// Delete the given keys. Returns how many existed.
    async fn delete_keys(&self, location: &Location, keys: &[Key]) -> StoreResult<usize>;

    /// Delete every record with a key in `[start, end]`.
    async fn delete_range(&self, location: &Location, start: Key, end: Key) -> StoreResult<usize>;

    /// Lightweight liveness check.
    async fn probe(&self, location: &Location) -> StoreResult<()>;
}
