//! Key mapping: the pure function from a raw key to the node(s) responsible for it
//! (§4.1). Couchbase buckets hash-partition via a `PartitionTable`; Memcached buckets
//! use a ketama consistent-hash ring directly over the node list.

mod couchbase;
mod memcached;

pub use couchbase::{partition_id_for_key, CouchbasePartitionMapper};
pub use memcached::KetamaRing;

use crate::cluster::partition::PartitionTable;

/// The two bucket-type-specific mapping strategies, selected once at bucket-open time
/// from the topology document's declared bucket type and never mixed thereafter.
#[derive(Debug, Clone)]
pub enum KeyMapper {
    Couchbase(PartitionTable),
    Memcached(KetamaRing),
}

/// Outcome of mapping a key: the partition id (meaningful only for `Couchbase`,
/// `0` otherwise) and the node indices that currently own it, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedKey {
    pub partition_id: u16,
    pub primary: i32,
    pub replicas: Vec<i32>,
}

impl KeyMapper {
    pub fn map(&self, key: &[u8]) -> MappedKey {
        match self {
            KeyMapper::Couchbase(table) => {
                let (partition_id, primary, replicas) = CouchbasePartitionMapper::map(key, table);
                MappedKey {
                    partition_id,
                    primary,
                    replicas,
                }
            }
            KeyMapper::Memcached(ring) => MappedKey {
                partition_id: 0,
                primary: ring.map(key).map_or(-1, |i| i as i32),
                replicas: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::partition::Partition;

    #[test]
    fn couchbase_mapper_reports_zero_partition_replicas_for_unowned() {
        let mapper = KeyMapper::Couchbase(PartitionTable::new(vec![Partition::unowned(0)]));
        let mapped = mapper.map(b"foo");
        assert_eq!(mapped.primary, -1);
    }

    #[test]
    fn memcached_mapper_has_no_replicas() {
        let ring = KetamaRing::build(&[("a".into(), 11210), ("b".into(), 11210)]);
        let mapper = KeyMapper::Memcached(ring);
        let mapped = mapper.map(b"foo");
        assert!(mapped.replicas.is_empty());
        assert!(mapped.primary >= 0);
    }
}
