//! Request status snapshots for asynchronously batched writes.
//!
//! A snapshot is written once when a write is submitted and updated at most
//! once more, when the write is persisted or given up on. It expires a fixed
//! time after submission; an expired request cannot be told apart from one
//! that never existed.

use crate::error::{Error, Result};
use crate::kv::{self, KeyValueStore};
use crate::types::{now_ms, Key, RequestId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a submitted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Queued, not yet persisted.
    Pending,
    /// Persisted to the owning partition's primary.
    Completed,
    /// Given up on.
    Failed { error: String },
}

impl RequestStatus {
    /// Whether the request reached a final state.
    pub fn is_final(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// Error message of a failed request.
    pub fn error(&self) -> Option<&str> {
        match self {
            RequestStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Stored state of one submitted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// Request identifier.
    pub request_id: RequestId,
    /// Partition key of the write.
    pub key: Key,
    /// Submitted payload.
    pub payload: Bytes,
    /// Current status.
    pub status: RequestStatus,
    /// Submission time (Unix ms).
    pub submitted_at_ms: u64,
    /// Last status change (Unix ms).
    pub updated_at_ms: u64,
    /// Expiry (Unix ms).
    pub expires_at_ms: u64,
}

/// Snapshot store on top of the key-value collaborator.
#[derive(Debug, Clone)]
pub struct RequestStatusStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

fn request_key(id: RequestId) -> String {
    format!("request/{}", id)
}

impl RequestStatusStore {
    /// Create a store whose snapshots live for `ttl`.
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Record a newly submitted write as pending.
    pub async fn create(&self, request_id: RequestId, key: Key, payload: Bytes) -> Result<()> {
        let now = now_ms();
        let snapshot = RequestSnapshot {
            request_id,
            key,
            payload,
            status: RequestStatus::Pending,
            submitted_at_ms: now,
            updated_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl.as_millis() as u64),
        };
        self.kv
            .set(&request_key(request_id), kv::encode(&snapshot)?, Some(self.ttl))
            .await?;
        Ok(())
    }

    /// Read a snapshot. Unknown and expired requests are `RequestNotFound`.
    pub async fn get(&self, request_id: RequestId) -> Result<RequestSnapshot> {
        kv::get_decoded(self.kv.as_ref(), &request_key(request_id))
            .await?
            .ok_or(Error::RequestNotFound(request_id))
    }

    /// Mark a request as persisted.
    pub async fn mark_completed(&self, request_id: RequestId) -> Result<()> {
        self.finish(request_id, RequestStatus::Completed).await
    }

    /// Mark a request as failed with a readable error.
    pub async fn mark_failed(&self, request_id: RequestId, error: impl Into<String>) -> Result<()> {
        self.finish(
            request_id,
            RequestStatus::Failed {
                error: error.into(),
            },
        )
        .await
    }

    /// Move a pending snapshot to a final status, keeping its expiry.
    async fn finish(&self, request_id: RequestId, status: RequestStatus) -> Result<()> {
        let key = request_key(request_id);
        let Some(mut snapshot) = kv::get_decoded::<RequestSnapshot>(self.kv.as_ref(), &key).await?
        else {
            tracing::debug!(request_id = %request_id, status = %status, "Request snapshot expired before update");
            return Ok(());
        };
        if snapshot.status.is_final() {
            return Ok(());
        }

        let now = now_ms();
        let remaining = snapshot.expires_at_ms.saturating_sub(now);
        if remaining == 0 {
            return Ok(());
        }
        snapshot.status = status;
        snapshot.updated_at_ms = now;
        self.kv
            .set(
                &key,
                kv::encode(&snapshot)?,
                Some(Duration::from_millis(remaining)),
            )
            .await?;
        Ok(())
    }
}
