//! Placement of new partitions onto store nodes.
//!
//! Copies of a partition always land on distinct nodes. Successive
//! partitions rotate the starting node so primaries spread evenly.

use crate::config::PlacementConfig;
use crate::partition::PartitionId;
use crate::types::Location;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin placement over a fixed node list.
#[derive(Debug)]
pub struct Placement {
    config: PlacementConfig,
    next: AtomicUsize,
}

impl Placement {
    /// Create a placement policy.
    pub fn new(config: PlacementConfig) -> Self {
        Self {
            config,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of copies each partition gets.
    pub fn copies(&self) -> usize {
        self.config.copies().min(self.config.nodes.len())
    }

    /// Choose the primary and replica locations for a new partition.
    ///
    /// Returns `None` if no store nodes are configured.
    pub fn assign(&self, id: PartitionId) -> Option<(Location, Vec<Location>)> {
        let nodes = &self.config.nodes;
        if nodes.is_empty() {
            return None;
        }
        let first = self.next.fetch_add(1, Ordering::Relaxed);
        let table = id.table_name();
        let mut locations = (0..self.copies())
            .map(|i| Location::new(nodes[(first + i) % nodes.len()].clone(), table.clone()));
        let primary = locations.next()?;
        Some((primary, locations.collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(nodes: &[&str], replicas: usize) -> Placement {
        let mut config = PlacementConfig::new(nodes.iter().map(|n| n.to_string()).collect());
        config.replicas_per_partition = replicas;
        Placement::new(config)
    }

    #[test]
    fn test_copies_on_distinct_nodes() {
        let placement = placement(&["a", "b", "c"], 2);
        let id = PartitionId::new();
        let (primary, replicas) = placement.assign(id).unwrap();

        assert_eq!(replicas.len(), 2);
        assert!(!replicas.contains(&primary));
        assert_ne!(replicas[0].node, replicas[1].node);
        assert!(replicas.iter().all(|r| r.table == id.table_name()));
    }

    #[test]
    fn test_primaries_rotate() {
        let placement = placement(&["a", "b", "c"], 1);
        let primaries: Vec<String> = (0..3)
            .map(|_| placement.assign(PartitionId::new()).unwrap().0.node)
            .collect();
        assert_eq!(primaries, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_replicas_capped_by_node_count() {
        let placement = placement(&["a"], 3);
        let (_, replicas) = placement.assign(PartitionId::new()).unwrap();
        assert!(replicas.is_empty());
        assert!(self::placement(&[], 1).assign(PartitionId::new()).is_none());
    }
}
