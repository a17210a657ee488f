//! Lease naming and blocking acquisition.

use super::{KeyValueStore, Lease};
use crate::error::{Error, Result};
use crate::partition::PartitionId;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Lease shared by the batch drainer and the splitter of one partition.
pub fn partition_lease_name(partition_id: PartitionId) -> String {
    format!("lease/partition/{}", partition_id)
}

/// Creation lock for one hash bucket of the key space.
pub fn creation_lock_name(bucket: u32) -> String {
    format!("lock/create/{:04}", bucket)
}

/// Take a lease, retrying with backoff until `timeout` elapses.
///
/// Returns `LeaseTimeout` when the lease stays held by someone else and
/// `Cancelled` when the token fires first.
pub async fn acquire_blocking(
    kv: &dyn KeyValueStore,
    name: &str,
    holder: &str,
    ttl: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Lease> {
    let started = Instant::now();
    let mut backoff = Duration::from_millis(2);

    loop {
        if let Some(lease) = kv.try_acquire_lease(name, holder, ttl).await? {
            return Ok(lease);
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            tracing::debug!(lease = name, ?timeout, "Gave up waiting for lease");
            return Err(Error::LeaseTimeout(name.to_string()));
        }

        let wait = backoff.min(timeout - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        backoff = (backoff * 2).min(Duration::from_millis(100));
    }
}

/// A lease kept alive across long work by renewing it between steps.
#[derive(Debug)]
pub struct HeldLease {
    kv: Arc<dyn KeyValueStore>,
    lease: Lease,
    ttl: Duration,
}

impl HeldLease {
    pub fn new(kv: Arc<dyn KeyValueStore>, lease: Lease, ttl: Duration) -> Self {
        Self { kv, lease, ttl }
    }

    /// Extend the deadline by another ttl.
    ///
    /// `LeaseLost` once the lease has expired, since another holder may
    /// already have taken it.
    pub async fn renew(&self) -> Result<()> {
        match self.kv.renew_lease(&self.lease, self.ttl).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                tracing::warn!(lease = %self.lease.name, "Lease expired while held");
                Err(Error::LeaseLost(self.lease.name.clone()))
            }
            Err(e) => Err(Error::MapUnavailable(e.to_string())),
        }
    }

    /// Run `work` while renewing the lease every third of its ttl.
    ///
    /// If a renewal fails, `work` is dropped where it stands and its error
    /// (`LeaseLost` or `MapUnavailable`) is returned instead.
    pub async fn keep_alive<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let period = (self.ttl / 3).max(Duration::from_millis(1));
        let heartbeat = async {
            loop {
                tokio::time::sleep(period).await;
                if let Err(e) = self.renew().await {
                    return e;
                }
            }
        };
        tokio::select! {
            biased;
            result = work => result,
            lost = heartbeat => Err(lost),
        }
    }

    /// Give the lease back. Failures are logged; the lease then expires.
    pub async fn release(self) {
        if let Err(e) = self.kv.release_lease(&self.lease).await {
            tracing::warn!(lease = %self.lease.name, error = %e, "Failed to release lease");
        }
    }
}
