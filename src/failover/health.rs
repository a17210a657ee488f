//! Health probing of partition copies.
//!
//! A probe is a trivial read against a location with a short timeout,
//! retried with backoff. Results are kept per location so the write path can
//! answer "was the primary healthy recently" without touching the store.

use crate::config::FailoverConfig;
use crate::metrics::RouterMetrics;
use crate::store::PartitionStore;
use crate::types::{now_ms, Location};
use dashmap::DashMap;
use std::sync::Arc;

/// Health status of a storage location.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Last probe succeeded within the freshness window.
    Healthy,
    /// Never probed, or the last success is older than the freshness window.
    Unknown,
    /// Some operations failed but the last probe succeeded.
    Degraded { reason: String },
    /// The last probe failed every attempt.
    Down { reason: String },
}

impl HealthStatus {
    /// Check if the status indicates a healthy location.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Get the severity level (0 = healthy, 1 = unknown, 2 = degraded, 3 = down).
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded { .. } => 2,
            HealthStatus::Down { .. } => 3,
        }
    }

    /// Get the reason string, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            HealthStatus::Healthy | HealthStatus::Unknown => None,
            HealthStatus::Degraded { reason } | HealthStatus::Down { reason } => Some(reason),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Degraded { reason } => write!(f, "degraded: {}", reason),
            HealthStatus::Down { reason } => write!(f, "down: {}", reason),
        }
    }
}

/// What is known about one location.
#[derive(Debug, Clone, Default)]
pub struct LocationHealth {
    /// Last successful probe (Unix ms).
    pub last_success_ms: Option<u64>,
    /// Last failure, probe or operation (Unix ms).
    pub last_failure_ms: Option<u64>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Reason of the last failure.
    pub last_error: Option<String>,
}

/// Probes locations and remembers the outcome.
#[derive(Debug)]
pub struct HealthProber {
    store: Arc<dyn PartitionStore>,
    config: FailoverConfig,
    metrics: Arc<RouterMetrics>,
    records: DashMap<Location, LocationHealth>,
}

impl HealthProber {
    /// Create a prober.
    pub fn new(
        store: Arc<dyn PartitionStore>,
        config: FailoverConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            records: DashMap::new(),
        }
    }

    /// Probe a location now, retrying with backoff. Returns whether it answered.
    pub async fn probe(&self, location: &Location) -> bool {
        let mut backoff = self.config.probe_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.config.probe_attempts.max(1) {
            match tokio::time::timeout(self.config.probe_timeout, self.store.probe(location)).await
            {
                Ok(Ok(())) => {
                    self.record_success(location);
                    return true;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("probe timed out after {:?}", self.config.probe_timeout),
            }
            tracing::debug!(location = %location, attempt, error = %last_error, "Probe failed");
            if attempt < self.config.probe_attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        self.metrics.probe_failures.inc();
        tracing::warn!(location = %location, error = %last_error, "Location failed health probe");
        self.record_failure(location, &last_error);
        false
    }

    /// Healthy if the last probe succeeded within the freshness window and
    /// nothing failed since.
    pub fn is_fresh(&self, location: &Location) -> bool {
        self.status(location).is_healthy()
    }

    /// Fresh result if there is one, otherwise a live probe.
    pub async fn check(&self, location: &Location) -> bool {
        self.is_fresh(location) || self.probe(location).await
    }

    /// Record a successful probe.
    pub fn record_success(&self, location: &Location) {
        let mut entry = self.records.entry(location.clone()).or_default();
        entry.last_success_ms = Some(now_ms());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    /// Record a failed probe or operation against a location.
    pub fn record_failure(&self, location: &Location, reason: &str) {
        let mut entry = self.records.entry(location.clone()).or_default();
        entry.last_failure_ms = Some(now_ms());
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(reason.to_string());
    }

    /// Current status of a location.
    pub fn status(&self, location: &Location) -> HealthStatus {
        let Some(record) = self.records.get(location).map(|r| r.clone()) else {
            return HealthStatus::Unknown;
        };
        if record.consecutive_failures > 0 {
            let reason = record.last_error.unwrap_or_default();
            return if record.last_success_ms.is_some() && record.consecutive_failures == 1 {
                HealthStatus::Degraded { reason }
            } else {
                HealthStatus::Down { reason }
            };
        }
        let freshness = self.config.health_freshness.as_millis() as u64;
        match record.last_success_ms {
            Some(success) if now_ms().saturating_sub(success) <= freshness => HealthStatus::Healthy,
            _ => HealthStatus::Unknown,
        }
    }

    /// Snapshot of every tracked location.
    pub fn report(&self) -> Vec<(Location, LocationHealth)> {
        let mut all: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
