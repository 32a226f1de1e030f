//! Simulated reconfiguration sequence (§8 scenario 2): a four-node topology is
//! replaced by a three-node one with a higher revision; `map` must never again
//! return the retired node's index, and a stale document must be ignored.

use std::sync::Arc;
use std::time::Duration;

use vbucket_core::cluster::ClusterView;
use vbucket_core::config::PoolConfiguration;
use vbucket_core::config_provider::parser::{build_snapshot, TopologyDocument};
use vbucket_core::io::factory::IoServiceFactory;

/// A factory whose pool never actually dials out (`min_size: 0`), so this test's
/// simulated reconfiguration doesn't need a live server.
fn test_factory() -> IoServiceFactory {
    IoServiceFactory::new(
        "default".into(),
        String::new(),
        None,
        false,
        None,
        PoolConfiguration {
            min_size: 0,
            max_size: 1,
            wait_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
        },
        true,
        None,
        64,
        Duration::from_secs(30),
    )
}

fn doc(rev: u32, node_count: usize) -> String {
    let nodes: Vec<String> = (0..node_count)
        .map(|i| format!(r#"{{"hostname": "node{i}.example", "ports": {{"direct": 11210}}, "services": ["kv"]}}"#))
        .collect();
    let server_list: Vec<String> = (0..node_count).map(|i| format!("\"node{i}.example:11210\"")).collect();
    let vbucket_map: Vec<String> = (0..4).map(|i| format!("[{}]", i % node_count)).collect();

    format!(
        r#"{{
            "rev": {rev},
            "bucketType": "couchbase",
            "nodes": [{}],
            "vBucketServerMap": {{"serverList": [{}], "vBucketMap": [{}]}}
        }}"#,
        nodes.join(","),
        server_list.join(","),
        vbucket_map.join(",")
    )
}

#[tokio::test]
async fn reconfiguration_drops_the_retired_node_and_ignores_stale_documents() {
    let factory = test_factory();

    let initial_doc = TopologyDocument::parse(&doc(10, 4)).unwrap();
    let initial = build_snapshot(&initial_doc, "bootstrap.example", false, None, &factory).await.unwrap();
    let view = Arc::new(ClusterView::new(initial));

    let next_doc = TopologyDocument::parse(&doc(11, 3)).unwrap();
    let previous = view.snapshot();
    let next = build_snapshot(&next_doc, "bootstrap.example", false, Some(previous.as_ref()), &factory).await.unwrap();
    assert!(view.reconfigure(next));

    let snapshot = view.snapshot();
    assert_eq!(snapshot.revision, 11);
    assert_eq!(snapshot.nodes.len(), 3);

    for key in [b"a".as_slice(), b"b", b"c", b"d", b"key-x"] {
        let mapped = snapshot.key_mapper.map(key);
        assert!(mapped.primary < 3, "mapped key {key:?} referenced retired node index {}", mapped.primary);
    }

    let stale_doc = TopologyDocument::parse(&doc(5, 2)).unwrap();
    let previous = view.snapshot();
    let stale = build_snapshot(&stale_doc, "bootstrap.example", false, Some(previous.as_ref()), &factory).await.unwrap();
    assert!(!view.reconfigure(stale));
    assert_eq!(view.revision(), 11);
}
