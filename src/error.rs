//! Error types for the partition router.

use crate::partition::PartitionId;
use crate::types::{Key, Location, RequestId};
use thiserror::Error;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the partition router.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Physical provisioning of a new partition failed. No partial state is kept.
    #[error("provisioning failed at {location}: {reason}")]
    Provisioning { location: Location, reason: String },

    /// The partition map's metadata store is unreachable.
    #[error("partition map unavailable: {0}")]
    MapUnavailable(String),

    /// Neither the primary nor any replica of a partition is usable.
    #[error("all replicas unavailable for partition {partition_id}")]
    AllReplicasUnavailable { partition_id: PartitionId },

    /// A store operation failed in a way that may succeed on retry.
    #[error("transient store error at {location}: {reason}")]
    TransientStore { location: Location, reason: String },

    /// A recovery pass found a migration that did not finish.
    #[error("migration incomplete for partition {partition_id}: {detail}")]
    MigrationIncomplete {
        partition_id: PartitionId,
        detail: String,
    },

    /// No record is stored under the key.
    #[error("record not found: key {0}")]
    RecordNotFound(Key),

    /// The request is unknown or its status has expired.
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// Partition does not exist in the map.
    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),

    /// Optimistic version check failed on a metadata mutation.
    #[error("version conflict on partition {partition_id}: expected {expected}, found {actual}")]
    VersionConflict {
        partition_id: PartitionId,
        expected: u64,
        actual: u64,
    },

    /// A blocking lease acquisition gave up.
    #[error("timed out acquiring lease {0}")]
    LeaseTimeout(String),

    /// A held lease expired or was taken over before the work finished.
    #[error("lease {0} lost before the operation finished")]
    LeaseLost(String),

    /// Key-value collaborator errors.
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Encoding or decoding of stored values failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the batch queue and splitter should retry this error locally.
    ///
    /// Structural failures (map unavailable, all replicas down) are never
    /// retried silently.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientStore { .. }
                | Error::VersionConflict { .. }
                | Error::Timeout
                | Error::MigrationIncomplete { .. }
        )
    }

    /// Map any error raised while talking to the metadata store into
    /// `MapUnavailable`, keeping errors that already carry meaning.
    pub(crate) fn into_map_error(self) -> Self {
        match self {
            Error::Kv(e) => Error::MapUnavailable(e.to_string()),
            other => other,
        }
    }
}

/// Errors from the durable key-value collaborator.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    /// The store cannot be reached.
    #[error("kv store unavailable: {0}")]
    Unavailable(String),

    /// A stored value has the wrong shape for the requested operation.
    #[error("corrupted value at key '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

/// Partition store adapter errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backing store at this location does not answer.
    #[error("location {0} unavailable")]
    Unavailable(Location),

    /// The location has no physical structure yet.
    #[error("location {0} not provisioned")]
    NotProvisioned(Location),

    /// The operation did not complete in time.
    #[error("operation at {0} timed out")]
    Timeout(Location),

    /// Any other I/O failure.
    #[error("io error at {location}: {reason}")]
    Io { location: Location, reason: String },
}

impl StoreError {
    /// The location the error was raised for.
    pub fn location(&self) -> &Location {
        match self {
            StoreError::Unavailable(l) | StoreError::NotProvisioned(l) | StoreError::Timeout(l) => l,
            StoreError::Io { location, .. } => location,
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::TransientStore {
            location: e.location().clone(),
            reason: e.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_is_transient() {
        let loc = Location::new("node-a", "p_1");
        let err: Error = StoreError::Unavailable(loc.clone()).into();
        assert!(err.is_transient());
        assert!(matches!(err, Error::TransientStore { ref location, .. } if *location == loc));
    }

    #[test]
    fn test_structural_errors_not_transient() {
        assert!(!Error::MapUnavailable("down".into()).is_transient());
        assert!(!Error::AllReplicasUnavailable {
            partition_id: PartitionId::new()
        }
        .is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_kv_error_maps_to_map_unavailable() {
        let err = Error::Kv(KvError::Unavailable("connection refused".into())).into_map_error();
        assert!(matches!(err, Error::MapUnavailable(_)));

        let err = Error::PartitionNotFound(PartitionId::new()).into_map_error();
        assert!(matches!(err, Error::PartitionNotFound(_)));
    }
}
