//! Topology document parsing and normalization (§4.5): turns a raw JSON topology
//! document into a `ClusterSnapshot`.

use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::cluster::node::{DataEndpoint, Node, NodeServices};
use crate::cluster::partition::{Partition, PartitionTable};
use crate::cluster::service_uri::{SelectionPolicy, ServiceUriBag};
use crate::cluster::ClusterSnapshot;
use crate::error::{CoreError, Result};
use crate::io::factory::IoServiceFactory;
use crate::key_mapper::{KeyMapper, KetamaRing};

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    ports: RawPorts,
    #[serde(default)]
    services: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPorts {
    direct: Option<u16>,
    #[serde(rename = "sslDirect")]
    ssl_direct: Option<u16>,
    #[serde(default)]
    n1ql: Option<u16>,
    #[serde(rename = "n1qlSSL", default)]
    n1ql_ssl: Option<u16>,
    #[serde(default)]
    fts: Option<u16>,
    #[serde(rename = "ftsSSL", default)]
    fts_ssl: Option<u16>,
    #[serde(default)]
    cbas: Option<u16>,
    #[serde(rename = "cbasSSL", default)]
    cbas_ssl: Option<u16>,
    #[serde(rename = "capi")]
    views: Option<u16>,
    #[serde(rename = "capiSSL", default)]
    views_ssl: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawVBucketServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

#[derive(Debug, Deserialize)]
pub struct TopologyDocument {
    rev: u64,
    #[serde(rename = "bucketType")]
    bucket_type: String,
    nodes: Vec<RawNode>,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawVBucketServerMap>,
}

impl TopologyDocument {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CoreError::Serialization(format!("invalid topology document: {e}")))
    }

    pub fn revision(&self) -> u64 {
        self.rev
    }
}

fn parse_services(raw: &[String]) -> NodeServices {
    let mut services = NodeServices::empty();
    for s in raw {
        services |= match s.as_str() {
            "kv" => NodeServices::DATA,
            "capi" => NodeServices::VIEW,
            "n1ql" => NodeServices::QUERY,
            "index" => NodeServices::INDEX,
            "fts" => NodeServices::SEARCH,
            "cbas" => NodeServices::ANALYTICS,
            "mgmt" => NodeServices::MGMT,
            _ => NodeServices::empty(),
        };
    }
    services
}

/// Replaces a `$HOST` placeholder (used by single-node / loopback clusters to avoid
/// hardcoding an externally-unreachable hostname) with the host actually dialed to
/// bootstrap this cluster.
fn resolve_host(hostname: &str, bootstrap_host: &str) -> String {
    if hostname == "$HOST" {
        bootstrap_host.to_string()
    } else {
        hostname.to_string()
    }
}

fn service_uri(host: &str, port: Option<u16>, use_ssl: bool, path_prefix: &str) -> Option<Url> {
    let port = port?;
    let scheme = if use_ssl { "https" } else { "http" };
    Url::parse(&format!("{scheme}://{host}:{port}{path_prefix}")).ok()
}

/// Builds a `ClusterSnapshot` from a parsed topology document, resolving `$HOST`
/// placeholders against `bootstrap_host`, selecting plain or TLS ports per `use_ssl`,
/// and validating that every partition-table index is in range before it is ever
/// installed into a `ClusterView` (§4.5).
///
/// Implements §4.2's reconfiguration algorithm: an endpoint (matched by host and plain
/// address) present in both `previous` and the new document keeps its existing `Node`
/// verbatim, preserving its `ConnectionPool`/IO Service and health counters rather than
/// dialing a fresh connection; a genuinely new endpoint is built through `factory`.
/// Nodes from `previous` that have no counterpart in the new document are disposed of
/// in the background once the new snapshot has been assembled.
pub async fn build_snapshot(
    doc: &TopologyDocument,
    bootstrap_host: &str,
    use_ssl: bool,
    previous: Option<&ClusterSnapshot>,
    factory: &IoServiceFactory,
) -> Result<ClusterSnapshot> {
    let mut nodes = Vec::with_capacity(doc.nodes.len());
    for raw in &doc.nodes {
        let host = resolve_host(&raw.hostname, bootstrap_host);
        let plain_port = raw.ports.direct.ok_or_else(|| {
            CoreError::Serialization(format!("node {host} is missing a direct data port"))
        })?;
        let plain = format!("{host}:{plain_port}")
            .parse()
            .map_err(|e| CoreError::Serialization(format!("invalid node address {host}:{plain_port}: {e}")))?;
        let tls = raw
            .ports
            .ssl_direct
            .map(|p| format!("{host}:{p}").parse())
            .transpose()
            .map_err(|e| CoreError::Serialization(format!("invalid TLS node address: {e}")))?;
        let data = DataEndpoint { plain, tls };

        let reused = previous.and_then(|snap| {
            snap.nodes.iter().find(|n| n.host == host && n.data.plain == plain).cloned()
        });
        let node = match reused {
            Some(existing) => existing,
            None => {
                let io = Arc::new(factory.build(&host, &data, use_ssl).await?);
                Arc::new(Node::new(host, data, parse_services(&raw.services), doc.rev, io))
            }
        };
        nodes.push(node);
    }

    if let Some(snap) = previous {
        for old in &snap.nodes {
            if !nodes.iter().any(|n| Arc::ptr_eq(n, old)) {
                let io = old.io.clone();
                tokio::spawn(async move { io.dispose().await });
            }
        }
    }

    let key_mapper = match doc.bucket_type.as_str() {
        "membase" | "couchbase" => {
            let table = match &doc.vbucket_server_map {
                Some(map) => build_partition_table(map, nodes.len())?,
                None => PartitionTable::empty(),
            };
            KeyMapper::Couchbase(table)
        }
        "memcached" => {
            let endpoints: Vec<(String, u16)> = doc
                .nodes
                .iter()
                .filter_map(|n| n.ports.direct.map(|p| (resolve_host(&n.hostname, bootstrap_host), p)))
                .collect();
            KeyMapper::Memcached(KetamaRing::build(&endpoints))
        }
        other => return Err(CoreError::Serialization(format!("unrecognized bucket type '{other}'"))),
    };

    let query_uris = collect_uris(&doc.nodes, bootstrap_host, use_ssl, |p| (p.n1ql, p.n1ql_ssl), "/query/service");
    let analytics_uris = collect_uris(&doc.nodes, bootstrap_host, use_ssl, |p| (p.cbas, p.cbas_ssl), "/analytics/service");
    let search_uris = collect_uris(&doc.nodes, bootstrap_host, use_ssl, |p| (p.fts, p.fts_ssl), "");
    let view_uris = collect_uris(&doc.nodes, bootstrap_host, use_ssl, |p| (p.views, p.views_ssl), "");

    Ok(ClusterSnapshot {
        revision: doc.rev,
        nodes,
        key_mapper,
        query_uris: ServiceUriBag::new(query_uris, SelectionPolicy::RoundRobin),
        analytics_uris: ServiceUriBag::new(analytics_uris, SelectionPolicy::RoundRobin),
        search_uris: ServiceUriBag::new(search_uris, SelectionPolicy::Random),
        view_uris: ServiceUriBag::new(view_uris, SelectionPolicy::Random),
    })
}

fn collect_uris(
    nodes: &[RawNode],
    bootstrap_host: &str,
    use_ssl: bool,
    port_of: impl Fn(&RawPorts) -> (Option<u16>, Option<u16>),
    path_prefix: &str,
) -> Vec<Url> {
    nodes
        .iter()
        .filter_map(|n| {
            let host = resolve_host(&n.hostname, bootstrap_host);
            let (plain, tls) = port_of(&n.ports);
            let port = if use_ssl { tls.or(plain) } else { plain };
            service_uri(&host, port, use_ssl, path_prefix)
        })
        .collect()
}

fn build_partition_table(map: &RawVBucketServerMap, node_count: usize) -> Result<PartitionTable> {
    if !map.vbucket_map.len().is_power_of_two() {
        return Err(CoreError::Serialization(format!(
            "vBucketMap length {} is not a power of two",
            map.vbucket_map.len()
        )));
    }
    let partitions: Vec<Partition> = map
        .vbucket_map
        .iter()
        .map(|row| {
            let primary = row.first().copied().unwrap_or(-1);
            let replicas = row.iter().skip(1).copied().collect();
            Partition { primary, replicas }
        })
        .collect();
    let table = PartitionTable::new(partitions);

    let referenced_node_count = map.server_list.len().max(node_count);
    if !table.indices_in_range(referenced_node_count) {
        return Err(CoreError::Serialization(
            "partition table references a node index out of range".into(),
        ));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A factory whose pool never actually dials out (`min_size: 0`), so unit tests
    /// that build a snapshot from scratch don't need a live server.
    fn test_factory() -> IoServiceFactory {
        IoServiceFactory::new(
            "default".into(),
            String::new(),
            None,
            false,
            None,
            crate::config::PoolConfiguration {
                min_size: 0,
                max_size: 1,
                wait_timeout: std::time::Duration::from_secs(1),
                shutdown_timeout: std::time::Duration::from_secs(1),
                idle_timeout: std::time::Duration::from_secs(30),
            },
            true,
            None,
            64,
            std::time::Duration::from_secs(30),
        )
    }

    fn sample_doc() -> &'static str {
        r#"{
            "rev": 12,
            "bucketType": "couchbase",
            "nodes": [
                {"hostname": "$HOST", "ports": {"direct": 11210, "n1ql": 8093}, "services": ["kv", "n1ql"]},
                {"hostname": "node2.example", "ports": {"direct": 11210}, "services": ["kv"]}
            ],
            "vBucketServerMap": {
                "serverList": ["$HOST:11210", "node2.example:11210"],
                "vBucketMap": [[0, 1], [1, 0]]
            }
        }"#
    }

    #[tokio::test]
    async fn resolves_host_placeholder_and_builds_snapshot() {
        let doc = TopologyDocument::parse(sample_doc()).unwrap();
        let factory = test_factory();
        let snapshot = build_snapshot(&doc, "bootstrap.example", false, None, &factory).await.unwrap();
        assert_eq!(snapshot.revision, 12);
        assert_eq!(snapshot.nodes[0].host, "bootstrap.example");
        assert_eq!(snapshot.nodes[1].host, "node2.example");
    }

    #[tokio::test]
    async fn out_of_range_partition_index_is_rejected() {
        let raw = r#"{
            "rev": 1,
            "bucketType": "couchbase",
            "nodes": [{"hostname": "$HOST", "ports": {"direct": 11210}, "services": ["kv"]}],
            "vBucketServerMap": {"serverList": ["$HOST:11210"], "vBucketMap": [[5]]}
        }"#;
        let doc = TopologyDocument::parse(raw).unwrap();
        let factory = test_factory();
        assert!(build_snapshot(&doc, "bootstrap.example", false, None, &factory).await.is_err());
    }

    #[tokio::test]
    async fn memcached_bucket_produces_a_ketama_ring() {
        let raw = r#"{
            "rev": 1,
            "bucketType": "memcached",
            "nodes": [
                {"hostname": "n1", "ports": {"direct": 11210}, "services": ["kv"]},
                {"hostname": "n2", "ports": {"direct": 11210}, "services": ["kv"]}
            ]
        }"#;
        let doc = TopologyDocument::parse(raw).unwrap();
        let factory = test_factory();
        let snapshot = build_snapshot(&doc, "bootstrap.example", false, None, &factory).await.unwrap();
        assert!(matches!(snapshot.key_mapper, KeyMapper::Memcached(_)));
    }

    #[tokio::test]
    async fn reconfiguration_reuses_a_node_present_in_both_views() {
        let doc = TopologyDocument::parse(sample_doc()).unwrap();
        let factory = test_factory();
        let first = build_snapshot(&doc, "bootstrap.example", false, None, &factory).await.unwrap();
        let second = build_snapshot(&doc, "bootstrap.example", false, Some(&first), &factory).await.unwrap();
        assert!(Arc::ptr_eq(&first.nodes[0], &second.nodes[0]));
        assert!(Arc::ptr_eq(&first.nodes[1], &second.nodes[1]));
    }

    #[tokio::test]
    async fn reconfiguration_builds_a_fresh_node_for_a_new_endpoint() {
        let doc = TopologyDocument::parse(sample_doc()).unwrap();
        let factory = test_factory();
        let first = build_snapshot(&doc, "bootstrap.example", false, None, &factory).await.unwrap();

        let raw = r#"{
            "rev": 13,
            "bucketType": "couchbase",
            "nodes": [
                {"hostname": "$HOST", "ports": {"direct": 11210, "n1ql": 8093}, "services": ["kv", "n1ql"]},
                {"hostname": "node3.example", "ports": {"direct": 11210}, "services": ["kv"]}
            ],
            "vBucketServerMap": {
                "serverList": ["$HOST:11210", "node3.example:11210"],
                "vBucketMap": [[0, 1], [1, 0]]
            }
        }"#;
        let doc2 = TopologyDocument::parse(raw).unwrap();
        let second = build_snapshot(&doc2, "bootstrap.example", false, Some(&first), &factory).await.unwrap();

        assert!(Arc::ptr_eq(&first.nodes[0], &second.nodes[0]));
        assert_eq!(second.nodes[1].host, "node3.example");
        assert!(!Arc::ptr_eq(&first.nodes[1], &second.nodes[1]));
    }
}
