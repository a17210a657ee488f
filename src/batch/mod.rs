//! Write batching queue.
//!
//! Writes are appended to a durable per-partition list and persisted later
//! by a drainer holding the partition lease. FIFO order holds per partition;
//! there is no ordering across partitions.
//!
//! ```text
//!  submit ─▶ queue/<pid> [e1, e2, e3, ...]
//!                 │ depth >= batch_size (or stale head)
//!                 ▼
//!          try lease/partition/<pid> ──held──▶ Contended (not an error)
//!                 │ acquired
//!                 ▼
//!          for head entry: re-resolve owner ─▶ write target ─▶ insert ─▶ mirror
//!                 │ ok: mark completed, pop
//!                 │ transient: attempts += 1, back off, retry
//!                 │ exhausted: dead/<pid>, mark failed, pop
//!                 ▼
//!          release lease
//! ```
//!
//! An entry leaves the queue only after its write is confirmed, so delivery
//! is at least once. Store inserts are last-writer-wins on the entry's
//! sequence number, which makes redelivery harmless.

mod queue;

pub use queue::WriteBatchQueue;

use crate::partition::PartitionId;
use crate::types::{now_ms, Key, Record, RequestId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One queued write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    /// Request that submitted the write.
    pub request_id: RequestId,
    /// Partition key.
    pub key: Key,
    /// Record payload.
    pub payload: Bytes,
    /// Global write sequence.
    pub seq: u64,
    /// Enqueue time (Unix ms).
    pub enqueued_at_ms: u64,
    /// Failed insert attempts so far.
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
}

impl BatchEntry {
    /// Create a fresh entry.
    pub fn new(request_id: RequestId, key: Key, payload: Bytes, seq: u64) -> Self {
        Self {
            request_id,
            key,
            payload,
            seq,
            enqueued_at_ms: now_ms(),
            attempts: 0,
            last_error: None,
        }
    }

    /// The record this entry persists.
    pub fn record(&self) -> Record {
        Record::new(self.key, self.payload.clone(), self.seq, self.request_id)
    }
}

/// An entry that exhausted its insert attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Queue the entry was taken from.
    pub partition_id: PartitionId,
    /// The entry, with its final attempt count.
    pub entry: BatchEntry,
    /// Error of the last attempt.
    pub error: String,
    /// When it was given up on (Unix ms).
    pub dead_at_ms: u64,
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries persisted.
    pub persisted: usize,
    /// Failed attempts that were retried.
    pub retries: usize,
    /// Entries dead-lettered.
    pub dead_lettered: usize,
    /// Entries left in the queue afterwards.
    pub remaining: usize,
    /// The lease expired before the drain finished.
    pub lease_lost: bool,
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue depth is below the batch size; nothing was done.
    BelowThreshold { depth: usize },
    /// Another drainer holds the partition lease.
    Contended,
    /// This call drained the queue.
    Drained(DrainReport),
}

impl DrainOutcome {
    /// Entries persisted by this call.
    pub fn persisted(&self) -> usize {
        match self {
            DrainOutcome::Drained(report) => report.persisted,
            _ => 0,
        }
    }
}
