//! Replica failover: health probing and primary promotion.

mod health;
mod manager;

pub use health::{HealthProber, HealthStatus, LocationHealth};
pub use manager::{FailoverManager, FailoverState, PartitionHealth};
