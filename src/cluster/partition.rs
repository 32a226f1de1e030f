//! The partition (vBucket) table: a fixed `P`-entry map from partition id to owning
//! node indices, swapped wholesale on reconfiguration (§3, §4.2).

use serde::{Deserialize, Serialize};

/// A single partition's ownership: a primary node index plus `R` replica indices.
/// `-1` is a legal value for any slot and means "no current owner" / "no replica at
/// this position"; callers resolve it via the random-live-node fallback rather than
/// treating it as an error (§4.1, §9 open question).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub primary: i32,
    pub replicas: Vec<i32>,
}

impl Partition {
    pub fn unowned(replica_count: usize) -> Self {
        Partition {
            primary: -1,
            replicas: vec![-1; replica_count],
        }
    }
}

/// The full partition table for one bucket: `P` partitions (a power of two), `R`
/// replicas per partition. Value-typed and owned solely by its `ClusterView`;
/// reconfiguration replaces it wholesale rather than mutating entries in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
    replica_count: usize,
}

impl PartitionTable {
    /// Builds a table from a dense vector of partitions. `partitions.len()` must be a
    /// power of two; this is enforced by the config provider's topology parser, not
    /// re-validated here since it is a pure value type.
    pub fn new(partitions: Vec<Partition>) -> Self {
        let replica_count = partitions.first().map_or(0, |p| p.replicas.len());
        PartitionTable {
            partitions,
            replica_count,
        }
    }

    pub fn empty() -> Self {
        PartitionTable {
            partitions: Vec::new(),
            replica_count: 0,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn get(&self, partition_id: u16) -> Option<&Partition> {
        self.partitions.get(partition_id as usize)
    }

    /// True when every node index referenced by the table lies within `[0, node_count)`
    /// or is the sentinel `-1`. The config provider's normalization step calls this to
    /// validate a freshly parsed topology document before installing it (§4.5).
    pub fn indices_in_range(&self, node_count: usize) -> bool {
        self.partitions.iter().all(|p| {
            index_in_range(p.primary, node_count)
                && p.replicas.iter().all(|&r| index_in_range(r, node_count))
        })
    }
}

fn index_in_range(index: i32, node_count: usize) -> bool {
    index == -1 || (0..node_count as i32).contains(&index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unowned_partition_has_negative_primary_and_replicas() {
        let p = Partition::unowned(2);
        assert_eq!(p.primary, -1);
        assert_eq!(p.replicas, vec![-1, -1]);
    }

    #[test]
    fn indices_in_range_accepts_sentinel_and_rejects_out_of_bounds() {
        let table = PartitionTable::new(vec![
            Partition {
                primary: -1,
                replicas: vec![0],
            },
            Partition {
                primary: 1,
                replicas: vec![3],
            },
        ]);
        assert!(!table.indices_in_range(2));
        assert!(table.indices_in_range(4));
    }
}
