//! The Memcached-bucket key mapper: a ketama-style consistent-hash ring (§4.1).

use md5::{Digest, Md5};

const POINTS_PER_REPLICA: u32 = 40;

fn md5_digest(input: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(input);
    hasher.finalize().into()
}

fn le_u32_at(digest: &[u8; 16], chunk: usize) -> u32 {
    u32::from_le_bytes(digest[chunk * 4..chunk * 4 + 4].try_into().unwrap())
}

/// One point on the hash ring: a hash value and the node index it routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingPoint {
    hash: u32,
    node_index: usize,
}

/// A ketama consistent-hash ring over the currently live data nodes of a Memcached
/// bucket. No replicas — Memcached buckets have none.
#[derive(Debug, Clone, Default)]
pub struct KetamaRing {
    points: Vec<RingPoint>,
}

impl KetamaRing {
    /// Builds a ring from `(host, port)` pairs in node-index order. Each node
    /// contributes `40 * 4 = 160` virtual points: the MD5 digest of
    /// `"<host>:<port>-<replica>"` for `replica` in `0..40` is split into four
    /// little-endian `u32` chunks, each one a ring point.
    pub fn build(nodes: &[(String, u16)]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * POINTS_PER_REPLICA as usize * 4);
        for (node_index, (host, port)) in nodes.iter().enumerate() {
            for replica in 0..POINTS_PER_REPLICA {
                let key = format!("{host}:{port}-{replica}");
                let digest = md5_digest(key.as_bytes());
                for chunk in 0..4 {
                    points.push(RingPoint {
                        hash: le_u32_at(&digest, chunk),
                        node_index,
                    });
                }
            }
        }
        points.sort_by_key(|p| p.hash);
        KetamaRing { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Maps a raw key to a node index: hash `MD5(key)[0..4]` little-endian, then take
    /// the first ring point whose hash is `>=` it, wrapping to the first point if the
    /// key's hash exceeds every point on the ring.
    pub fn map(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let digest = md5_digest(key);
        let key_hash = le_u32_at(&digest, 0);
        let idx = self.points.partition_point(|p| p.hash < key_hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].node_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<(String, u16)> {
        (0..n).map(|i| (format!("node{i}.example"), 11210)).collect()
    }

    #[test]
    fn map_is_deterministic_for_a_fixed_ring() {
        let ring = KetamaRing::build(&nodes(6));
        let a = ring.map(b"foo");
        let b = ring.map(b"foo");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn empty_ring_maps_nothing() {
        let ring = KetamaRing::build(&[]);
        assert_eq!(ring.map(b"foo"), None);
    }

    /// Scenario 5 (§8): adding a node to a six-node ring should leave at least 95% of
    /// a sample of random keys mapped to the node they mapped to before the add.
    #[test]
    fn adding_a_node_preserves_most_mappings() {
        let before = KetamaRing::build(&nodes(6));
        let after = KetamaRing::build(&nodes(7));

        let keys: Vec<String> = (0..10_000).map(|i| format!("key-{i}")).collect();
        let stable = keys
            .iter()
            .filter(|k| {
                let before_node = &nodes(6)[before.map(k.as_bytes()).unwrap()];
                let after_node = &nodes(7)[after.map(k.as_bytes()).unwrap()];
                before_node == after_node
            })
            .count();

        let ratio = stable as f64 / keys.len() as f64;
        assert!(ratio >= 0.95, "only {ratio:.3} of keys stayed stable");
    }
}
