//! Config Provider: fetches topology documents (CCCP, HTTP streaming, or periodic
//! polling) and drives `ClusterView` reconfiguration whenever a strictly newer
//! revision arrives (§4.5).

pub mod cccp;
pub mod http_stream;
pub mod parser;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::ClusterView;
use crate::error::Result;
use crate::io::factory::IoServiceFactory;
use parser::{build_snapshot, TopologyDocument};

/// Drives periodic CCCP polling, at `max(ConfigPollInterval, ConfigPollCheckFloor)`
/// (§6, §4.5 priority source 3). `fetch` abstracts over the actual transport — a data
/// connection's `GetClusterConfig` opcode in production, anything the caller likes in
/// tests.
pub struct ConfigProvider<F> {
    view: Arc<ClusterView>,
    bootstrap_host: String,
    use_ssl: bool,
    poll_interval: Duration,
    poll_check_floor: Duration,
    factory: IoServiceFactory,
    fetch: F,
}

impl<F, Fut> ConfigProvider<F>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: Arc<ClusterView>,
        bootstrap_host: String,
        use_ssl: bool,
        poll_interval: Duration,
        poll_check_floor: Duration,
        factory: IoServiceFactory,
        fetch: F,
    ) -> Self {
        ConfigProvider {
            view,
            bootstrap_host,
            use_ssl,
            poll_interval: poll_interval.max(poll_check_floor),
            poll_check_floor,
            factory,
            fetch,
        }
    }

    /// Fetches and applies one topology document. Returns whether it caused a
    /// reconfiguration (a stale or equal-revision document is a silent no-op, per
    /// §4.5's reconfiguration trigger rule).
    pub async fn poll_once(&self) -> Result<bool> {
        let raw = (self.fetch)().await?;
        self.apply(&raw).await
    }

    pub async fn apply(&self, raw: &str) -> Result<bool> {
        let doc = TopologyDocument::parse(raw)?;
        let previous = self.view.snapshot();
        let snapshot = build_snapshot(&doc, &self.bootstrap_host, self.use_ssl, Some(previous.as_ref()), &self.factory).await?;
        let revision = snapshot.revision;
        let applied = self.view.reconfigure(snapshot);
        if applied {
            info!(revision, "installed new cluster topology");
        }
        Ok(applied)
    }

    /// Runs the poll loop until cancelled. Intended to be spawned as a background
    /// task alongside bucket open, mirroring this codebase's periodic-sweep task
    /// pattern.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tick.tick().await;
            if let Err(err) = self.poll_once().await {
                warn!(error = %err, "config poll failed; retaining previous topology");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::partition::PartitionTable;
    use crate::cluster::service_uri::{SelectionPolicy, ServiceUriBag};
    use crate::cluster::ClusterSnapshot;
    use crate::key_mapper::KeyMapper;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn empty_snapshot(revision: u64) -> ClusterSnapshot {
        ClusterSnapshot {
            revision,
            nodes: Vec::new(),
            key_mapper: KeyMapper::Couchbase(PartitionTable::empty()),
            query_uris: ServiceUriBag::new(vec![], SelectionPolicy::RoundRobin),
            analytics_uris: ServiceUriBag::new(vec![], SelectionPolicy::RoundRobin),
            search_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
            view_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
        }
    }

    fn doc_with_revision(rev: u32) -> String {
        format!(
            r#"{{"rev": {rev}, "bucketType": "couchbase", "nodes": [{{"hostname": "$HOST", "ports": {{"direct": 11210}}, "services": ["kv"]}}], "vBucketServerMap": {{"serverList": ["$HOST:11210"], "vBucketMap": [[0]]}}}}"#
        )
    }

    /// A factory whose pool never actually dials out (`min_size: 0`), so tests that
    /// drive reconfiguration don't need a live server.
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

    #[tokio::test]
    async fn newer_revision_triggers_reconfiguration() {
        let view = Arc::new(ClusterView::new(empty_snapshot(1)));
        let calls = AtomicU32::new(0);
        let provider = ConfigProvider::new(
            view.clone(),
            "bootstrap.example".into(),
            false,
            Duration::from_secs(60),
            Duration::from_millis(10),
            test_factory(),
            || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move { Ok(doc_with_revision(2 + n)) }
            },
        );
        assert!(provider.poll_once().await.unwrap());
        assert_eq!(view.revision(), 2);
    }

    #[tokio::test]
    async fn stale_revision_is_a_silent_no_op() {
        let view = Arc::new(ClusterView::new(empty_snapshot(5)));
        let provider = ConfigProvider::new(
            view.clone(),
            "bootstrap.example".into(),
            false,
            Duration::from_secs(60),
            Duration::from_millis(10),
            test_factory(),
            || async { Ok(doc_with_revision(5)) },
        );
        assert!(!provider.poll_once().await.unwrap());
        assert_eq!(view.revision(), 5);
    }
}
