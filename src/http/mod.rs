//! HTTP Dispatcher: routes Query/Analytics/FTS/Views requests to a healthy service
//! URI drawn from the `ClusterView`, with failure accounting and fail-open (§4.6).

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cluster::service_uri::ServiceUriBag;
use crate::cluster::ClusterView;
use crate::error::{CoreError, Result};

/// The four HTTP-addressable services this dispatcher fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Query,
    Analytics,
    Search,
    View,
}

/// One dispatched HTTP call's raw outcome: status code plus body bytes. Request
/// shaping (view/N1QL/FTS/analytics DSLs) is explicitly out of scope (§1); this
/// type is the entire surface the core hands back to that external layer.
#[derive(Debug)]
pub struct HttpResult {
    pub status: reqwest::StatusCode,
    pub body: bytes::Bytes,
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    view: Arc<ClusterView>,
    failed_threshold: u32,
    rehab_interval: Duration,
}

impl HttpDispatcher {
    pub fn new(client: reqwest::Client, view: Arc<ClusterView>, failed_threshold: u32, rehab_interval: Duration) -> Self {
        HttpDispatcher {
            client,
            view,
            failed_threshold,
            rehab_interval,
        }
    }

    fn bag<'a>(snapshot: &'a crate::cluster::ClusterSnapshot, service: Service) -> &'a ServiceUriBag {
        match service {
            Service::Query => &snapshot.query_uris,
            Service::Analytics => &snapshot.analytics_uris,
            Service::Search => &snapshot.search_uris,
            Service::View => &snapshot.view_uris,
        }
    }

    /// Picks a URI per the service's selection policy, issues `body` as a POST (GET
    /// for an empty body, matching the view-query shape), and folds the outcome back
    /// into that URI's failure counter (§4.6).
    pub async fn dispatch(&self, service: Service, path_and_query: &str, body: Option<Vec<u8>>) -> Result<HttpResult> {
        let snapshot = self.view.snapshot();
        let bag = Self::bag(&snapshot, service);
        let uri = bag
            .select(self.failed_threshold, self.rehab_interval)
            .ok_or(CoreError::NoAvailableNode)?;

        let target_str = format!("{}{}", uri.uri.as_str().trim_end_matches('/'), path_and_query);
        let target = url::Url::parse(&target_str)?;

        let request = match &body {
            Some(b) => self.client.post(target).body(b.clone()),
            None => self.client.get(target),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    uri.record_success();
                } else if status.is_server_error() {
                    uri.record_failure();
                }
                let body = response.bytes().await?;
                Ok(HttpResult { status, body })
            }
            Err(err) => {
                uri.record_failure();
                Err(CoreError::from(err))
            }
        }
    }

    /// Periodic rehab ping (§AMBIENT STACK supplemented feature): touches every URI
    /// whose failure count is at or above threshold so a URI that recovered without
    /// ever seeing ordinary traffic again still gets a chance to clear its counter.
    pub async fn rehab_sweep(&self, service: Service) {
        let snapshot = self.view.snapshot();
        let bag = Self::bag(&snapshot, service);
        for uri in &bag.uris {
            if uri.failure_count() < self.failed_threshold {
                continue;
            }
            match self.client.head(uri.uri.clone()).send().await {
                Ok(resp) if resp.status().is_success() => uri.record_success(),
                Ok(_) => {}
                Err(err) => warn!(uri = %uri.uri, error = %err, "rehab ping failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::partition::PartitionTable;
    use crate::cluster::service_uri::SelectionPolicy;
    use crate::cluster::ClusterSnapshot;
    use crate::key_mapper::KeyMapper;

    fn snapshot_with_query_uris(uris: Vec<&str>) -> ClusterSnapshot {
        ClusterSnapshot {
            revision: 1,
            nodes: Vec::new(),
            key_mapper: KeyMapper::Couchbase(PartitionTable::empty()),
            query_uris: ServiceUriBag::new(uris.into_iter().map(|u| url::Url::parse(u).unwrap()).collect(), SelectionPolicy::RoundRobin),
            analytics_uris: ServiceUriBag::new(vec![], SelectionPolicy::RoundRobin),
            search_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
            view_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
        }
    }

    #[tokio::test]
    async fn dispatch_fails_with_no_available_node_when_bag_is_empty() {
        let view = Arc::new(ClusterView::new(snapshot_with_query_uris(vec![])));
        let dispatcher = HttpDispatcher::new(reqwest::Client::new(), view, 2, Duration::from_secs(30));
        let err = dispatcher.dispatch(Service::Query, "", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoAvailableNode));
    }

    #[test]
    fn bag_selects_query_uris_for_query_service() {
        let snapshot = snapshot_with_query_uris(vec!["http://n1:8093"]);
        let bag = HttpDispatcher::bag(&snapshot, Service::Query);
        assert_eq!(bag.uris.len(), 1);
    }
}
