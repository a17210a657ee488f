//! Durable key-value collaborator.
//!
//! The partition map, the batch queue and the request status snapshots are
//! layered on a small set of primitives: get/set with TTL, compare-and-set,
//! atomic increment, list push/pop and a mutual-exclusion lease with expiry.
//!
//! # Key layout
//!
//! ```text
//! map/version                    u64 counter, bumped on every map mutation
//! map/partition/<id>             bincode(Partition)
//! lock/create/<bucket>           creation lease for a hash bucket of the key space
//! lease/partition/<id>           drain/split lease
//! queue/<id>                     list of bincode(BatchEntry)
//! dead/<id>                      list of bincode(DeadLetter)
//! request/<id>                   bincode(RequestSnapshot), TTL bound
//! seq/writes                     global write sequence
//! ```

mod lease;
mod memory;

pub use lease::{acquire_blocking, creation_lock_name, partition_lease_name, HeldLease};
pub use memory::MemoryKv;

use crate::error::{Error, KvError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for key-value operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// A held lease. Only the holder named here may renew or release it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease name.
    pub name: String,
    /// Opaque holder identity.
    pub holder: String,
    /// Strictly increasing per lease name across acquisitions.
    pub fencing_token: u64,
    /// Expiry in Unix milliseconds.
    pub deadline_ms: u64,
}

/// Primitives the router needs from its metadata store.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Read a value.
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Write a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> KvResult<bool>;

    /// Delete a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Atomically add `by` to a counter and return the new value.
    async fn incr(&self, key: &str, by: u64) -> KvResult<u64>;

    /// All live values whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>>;

    /// Append to a list. Returns the new length.
    async fn list_push_back(&self, key: &str, value: Vec<u8>) -> KvResult<usize>;

    /// Overwrite the item at `index`. Returns false if there is no such item.
    async fn list_set(&self, key: &str, index: usize, value: Vec<u8>) -> KvResult<bool>;

    /// Read up to `count` items starting at `start` without removing them.
    async fn list_range(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<Vec<u8>>>;

    /// Remove and return up to `count` items from the head.
    async fn list_pop_front(&self, key: &str, count: usize) -> KvResult<Vec<Vec<u8>>>;

    /// Length of a list (0 if absent).
    async fn list_len(&self, key: &str) -> KvResult<usize>;

    /// Keys of all non-empty lists starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>>;

    /// Try once to take the named lease. `None` if someone else holds it.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> KvResult<Option<Lease>>;

    /// Extend a held lease. `None` if it was lost.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> KvResult<Option<Lease>>;

    /// Release a held lease. Returns false if it had already been lost.
    async fn release_lease(&self, lease: &Lease) -> KvResult<bool>;
}

/// Encode a value for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Error::from)
}

/// Decode a stored value, reporting the key on failure.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        Error::Kv(KvError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Read and decode a value.
pub async fn get_decoded<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(decode(key, &bytes)?)),
        None => Ok(None),
    }
}

/// Read a counter maintained with [`KeyValueStore::incr`]. Absent counters read as 0.
pub async fn get_counter(kv: &dyn KeyValueStore, key: &str) -> Result<u64> {
    match kv.get(key).await? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::Kv(KvError::Corrupted {
                    key: key.to_string(),
                    reason: format!("counter has {} bytes", bytes.len()),
                })
            })?;
            Ok(u64::from_be_bytes(raw))
        }
        None => Ok(0),
    }
}
