//! Core types used throughout the router.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Partition key. The key domain is the ordered range of `u64`.
pub type Key = u64;

/// Identifier of a submitted write request.
pub type RequestId = Uuid;

/// Identifier returned by a store insert.
pub type RecordId = Uuid;

/// Physical address of one copy of a partition: a store node plus the table
/// holding the partition's rows on that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Store node name.
    pub node: String,
    /// Table name on the node.
    pub table: String,
}

impl Location {
    /// Create a new location.
    pub fn new(node: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.table)
    }
}

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Partition key.
    pub key: Key,
    /// Opaque payload handed over by the validation layer.
    pub payload: Bytes,
    /// Global write sequence. Higher sequences win on conflicting keys.
    pub seq: u64,
    /// The request that produced this record.
    pub request_id: RequestId,
}

impl Record {
    /// Create a record.
    pub fn new(key: Key, payload: impl Into<Bytes>, seq: u64, request_id: RequestId) -> Self {
        Self {
            key,
            payload: payload.into(),
            seq,
            request_id,
        }
    }

    /// Record id as returned by the store.
    pub fn id(&self) -> RecordId {
        self.request_id
    }
}

/// Current wall clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = Location::new("node-a", "p_42");
        assert_eq!(loc.to_string(), "node-a/p_42");
    }

    #[test]
    fn test_location_ordering() {
        let a = Location::new("a", "t");
        let b = Location::new("b", "t");
        assert!(a < b);
    }

    #[test]
    fn test_record_serialization() {
        let record = Record::new(7, &b"payload"[..], 3, Uuid::new_v4());
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
        assert_eq!(decoded.id(), record.request_id);
    }
}
