//! A single data node: its addresses, service capabilities, and the health-tracking
//! state the IO Service consults before routing an operation to it (§3, §4.2, §4.3).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::io::IoService;

bitflags! {
    /// Which services this node exposes. Mirrors the `services`/`servicesAlternate`
    /// section of a topology document; a node missing a bit for a service the bucket
    /// needs is simply never selected as a candidate for that service's traffic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeServices: u16 {
        const DATA      = 0b0000_0001;
        const VIEW      = 0b0000_0010;
        const QUERY     = 0b0000_0100;
        const INDEX     = 0b0000_1000;
        const SEARCH    = 0b0001_0000;
        const ANALYTICS = 0b0010_0000;
        const MGMT      = 0b0100_0000;
    }
}

/// The addresses a node can be reached on for the data-path binary protocol: plain
/// and, when the cluster has TLS enabled, the TLS-variant port on the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEndpoint {
    pub plain: SocketAddr,
    pub tls: Option<SocketAddr>,
}

/// One data node's identity, capabilities, live health counters, and the IO Service
/// that owns its connections.
///
/// Health state (`failures`, `last_failure`, `down`) is interior-mutable so a node can
/// sit behind a shared `Arc` in both the `ClusterView`'s roster and any number of
/// in-flight `IoService` operations without a lock around the whole struct.
///
/// `io` is the reason a `Node` survives a reconfiguration verbatim instead of being
/// rebuilt from the new topology document: §4.2 requires an endpoint present in both
/// the old and new views to keep its `ConnectionPool`/IO Service, which in practice
/// means reusing the whole `Arc<Node>` rather than just copying its identity fields.
pub struct Node {
    pub host: String,
    pub data: DataEndpoint,
    pub services: NodeServices,
    pub revision: u64,
    pub io: Arc<IoService>,
    failures: AtomicU32,
    last_failure_millis: AtomicU64,
    down: AtomicBool,
    started_at: Instant,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.host)
            .field("data", &self.data)
            .field("services", &self.services)
            .field("revision", &self.revision)
            .field("down", &self.is_down())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl Node {
    pub fn new(host: String, data: DataEndpoint, services: NodeServices, revision: u64, io: Arc<IoService>) -> Self {
        Node {
            host,
            data,
            services,
            revision,
            io,
            failures: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
            down: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn supports(&self, services: NodeServices) -> bool {
        self.services.contains(services)
    }

    /// Records a transport-level failure. The caller (IO Service) decides, from
    /// `IOErrorThreshold`/`IOErrorCheckInterval`, whether this push should also mark
    /// the node down; this method only maintains the raw counters.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_millis
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.down.store(false, Ordering::Relaxed);
    }

    /// Records a transport failure as part of the rolling-window quarantine count
    /// (§4.4 `IOErrorCheckInterval`): a gap since the previous failure wider than
    /// `io_error_check_interval` starts a fresh count instead of extending the old
    /// streak, so failures scattered across unrelated incidents never add up into a
    /// spurious quarantine. Returns the failure count after this one is counted.
    pub fn record_failure_within_window(&self, io_error_check_interval: Duration) -> u32 {
        if let Some(elapsed) = self.time_since_last_failure() {
            if elapsed > io_error_check_interval {
                self.failures.store(0, Ordering::Relaxed);
            }
        }
        self.record_failure();
        self.failure_count()
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn time_since_last_failure(&self) -> Option<Duration> {
        let millis = self.last_failure_millis.load(Ordering::Relaxed);
        if millis == 0 {
            return None;
        }
        Some(self.started_at.elapsed().saturating_sub(Duration::from_millis(millis)))
    }

    pub fn mark_down(&self) {
        self.down.store(true, Ordering::Relaxed);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Relaxed)
    }

    /// Quarantine policy from §4.3: a node is eligible for routing when it isn't
    /// explicitly marked down, or its failure count has not yet crossed the
    /// threshold within the current check interval.
    pub fn is_eligible(&self, io_error_threshold: u32, io_error_check_interval: Duration) -> bool {
        if !self.is_down() {
            return true;
        }
        match self.time_since_last_failure() {
            Some(elapsed) if elapsed >= io_error_check_interval => true,
            Some(_) => self.failure_count() < io_error_threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::pool::{ConnectionPool, NodeAuth};

    fn test_io_service() -> Arc<IoService> {
        Arc::new(IoService::Pooled(ConnectionPool::new(
            NodeAuth {
                host: "node1.example".into(),
                addr: "127.0.0.1:11210".parse().unwrap(),
                username: "default".into(),
                password: String::new(),
                bucket: None,
                force_sasl_plain: false,
                tls: None,
            },
            crate::config::PoolConfiguration {
                min_size: 0,
                max_size: 1,
                wait_timeout: Duration::from_secs(1),
                shutdown_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_secs(30),
            },
            None,
        )))
    }

    fn node() -> Node {
        Node::new(
            "node1.example".into(),
            DataEndpoint {
                plain: "127.0.0.1:11210".parse().unwrap(),
                tls: None,
            },
            NodeServices::DATA | NodeServices::QUERY,
            1,
            test_io_service(),
        )
    }

    #[test]
    fn supports_checks_service_bits() {
        let n = node();
        assert!(n.supports(NodeServices::DATA));
        assert!(!n.supports(NodeServices::SEARCH));
    }

    #[test]
    fn success_resets_failures_and_clears_down() {
        let n = node();
        n.record_failure();
        n.record_failure();
        n.mark_down();
        assert!(n.is_down());
        n.record_success();
        assert_eq!(n.failure_count(), 0);
        assert!(!n.is_down());
    }

    #[test]
    fn eligible_when_not_down_even_with_failures() {
        let n = node();
        n.record_failure();
        assert!(n.is_eligible(3, Duration::from_secs(5)));
    }

    #[test]
    fn ineligible_when_down_and_under_threshold_within_interval() {
        let n = node();
        n.record_failure();
        n.mark_down();
        assert!(!n.is_eligible(3, Duration::from_secs(60)));
    }

    #[test]
    fn window_reset_does_not_apply_to_the_first_recorded_failure() {
        let n = node();
        assert_eq!(n.record_failure_within_window(Duration::from_millis(50)), 1);
    }

    #[test]
    fn consecutive_failures_within_the_window_accumulate() {
        let n = node();
        n.record_failure_within_window(Duration::from_secs(60));
        assert_eq!(n.record_failure_within_window(Duration::from_secs(60)), 2);
    }
}
