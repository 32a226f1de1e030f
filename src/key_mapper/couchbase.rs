//! The Couchbase-bucket key mapper: CRC32-based partition hashing (§4.1).

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::cluster::partition::PartitionTable;

/// Polynomial 0xEDB88320 is `CRC_32_ISO_HDLC` in the `crc` crate's catalog (the
/// reversed/"zip" CRC-32 used by, among others, the Couchbase vbucket hash).
const CRC32_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// `map(key) -> (partition_id, primary, replicas)` for a Couchbase (hash-partitioned)
/// bucket. Pure function of `(key, PartitionTable)` — no state beyond the table.
pub struct CouchbasePartitionMapper;

/// Computes the partition id for a raw key: `crc32(key)`, low 16 bits taken, then
/// masked to `P - 1` (`P` a power of two, so this is equivalent to `% P`).
pub fn partition_id_for_key(key: &[u8], num_partitions: usize) -> u16 {
    debug_assert!(
        num_partitions.is_power_of_two(),
        "partition count must be a power of two"
    );
    let digest = CRC32_ALGO.checksum(key);
    let low16 = (digest & 0xffff) as u16;
    low16 & (num_partitions as u16 - 1)
}

impl CouchbasePartitionMapper {
    /// Returns the partition id together with the primary/replica node indices the
    /// table currently has on file for it. `-1` values are preserved verbatim; the
    /// caller (Bucket Facade) owns the random-live-node fallback (§4.1, §8).
    pub fn map(key: &[u8], table: &PartitionTable) -> (u16, i32, Vec<i32>) {
        let num_partitions = table.num_partitions();
        if num_partitions == 0 {
            return (0, -1, Vec::new());
        }
        let partition_id = partition_id_for_key(key, num_partitions);
        match table.get(partition_id) {
            Some(partition) => (partition_id, partition.primary, partition.replicas.clone()),
            None => (partition_id, -1, Vec::new()),
        }
    }
}
