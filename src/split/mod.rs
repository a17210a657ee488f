//! Shard splitting.
//!
//! A partition whose record count reaches `max_shard_size` is cut at the
//! median key of its current contents. The upper half moves to a new child
//! partition:
//!
//! ```text
//!   parent [s, e] Active
//!        │ create child (m, e]      Splitting, role Child, not routable
//!        │ begin split              parent Splitting, plan (child, m)
//!        │                          keys > m now route to the child
//!        │ migrate (m, e] parent ─▶ child, chunk by chunk
//!        │ sync child replicas, trim parent replicas
//!        │ verify parent holds nothing above m
//!        ▼ commit                   child Active, then parent [s, m] Active
//! ```
//!
//! Every step runs under the parent's partition lease, the same lease the
//! batch drainer takes, so a split and a drain of the parent never overlap.
//! A failure leaves the parent `Splitting`; [`ShardSplitter::recover`] later
//! resumes the move, finishes a half-done commit, or rolls the plan back.

mod splitter;

pub use splitter::ShardSplitter;

use crate::partition::{KeyRange, PartitionId};
use crate::types::Key;
use std::time::Duration;

/// A committed split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    /// The partition that was split.
    pub parent: PartitionId,
    /// The partition created for the upper half.
    pub child: PartitionId,
    /// Last key kept by the parent.
    pub pivot: Key,
    /// Parent range after the split.
    pub parent_range: KeyRange,
    /// Child range.
    pub child_range: KeyRange,
    /// Records left in the parent.
    pub parent_count: u64,
    /// Records in the child.
    pub child_count: u64,
    /// Records moved by this call.
    pub migrated: u64,
    /// Wall time of this call.
    pub elapsed: Duration,
}

/// Result of a split check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// The partition holds fewer than `max_shard_size` records.
    BelowThreshold { count: u64 },
    /// The partition lease could not be taken in time.
    Contended,
    /// The partition cannot be split right now.
    Skipped { reason: String },
    /// The partition was split.
    Split(SplitReport),
}

impl SplitOutcome {
    /// The report of a committed split.
    pub fn report(&self) -> Option<&SplitReport> {
        match self {
            SplitOutcome::Split(report) => Some(report),
            _ => None,
        }
    }
}

/// What the recovery pass did for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// An unfinished split was carried through to its commit.
    Resumed(SplitReport),
    /// A split plan whose child was gone was dropped.
    Aborted { parent: PartitionId, child: PartitionId },
    /// A split child no parent refers to was retired.
    OrphanRetired { child: PartitionId },
    /// Recovery of the partition failed and will be tried again.
    Failed { partition_id: PartitionId, error: String },
}
