//! Partition map: the authoritative registry of key ranges and roles.
//!
//! Every key ever routed belongs to exactly one routable partition. New
//! partitions are created on demand for unseen keys, covering
//! `[key, key + default_span)` clipped before the next partition.
//!
//! # Split ownership
//!
//! ```text
//!            pivot
//!   parent [start ......|...... end]   status = splitting, plan = (child, pivot)
//!   child                [pivot+1 .. end]   status = splitting (not routable)
//!
//!   key <= pivot  -> parent
//!   key >  pivot  -> child (writes redirected while rows migrate)
//! ```
//!
//! Commit activates the child and shrinks the parent to `[start, pivot]`.

mod map;
mod placement;
mod types;

pub use map::PartitionMap;
pub use placement::Placement;
pub use types::{KeyRange, Partition, PartitionId, PartitionStatus, ReplicaLag, SplitRole};
