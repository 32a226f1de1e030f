//! Per-service HTTP URI bookkeeping for the HTTP Dispatcher (§4.6): each URI tracks
//! its own failure count so a flaky node can be passed over without taking the whole
//! service down.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use url::Url;

/// One HTTP-addressable URI for a service (Query, Analytics, FTS, Views), with the
/// failure counter and rehab timer the dispatcher consults.
#[derive(Debug)]
pub struct FailureCountingUri {
    pub uri: Url,
    failures: AtomicU32,
    last_failure_millis: AtomicU64,
    started_at: Instant,
}

impl FailureCountingUri {
    pub fn new(uri: Url) -> Self {
        FailureCountingUri {
            uri,
            failures: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_millis
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Healthy when under the failure threshold, or the rehab interval has passed
    /// since the last recorded failure — the background rehab ping relies on the
    /// latter to bring a retired URI back into rotation without a success response
    /// ever having reached it through ordinary traffic.
    pub fn is_healthy(&self, failed_threshold: u32, rehab_interval: Duration) -> bool {
        if self.failure_count() < failed_threshold {
            return true;
        }
        let millis = self.last_failure_millis.load(Ordering::Relaxed);
        if millis == 0 {
            return true;
        }
        self.started_at.elapsed().saturating_sub(Duration::from_millis(millis)) >= rehab_interval
    }
}

/// The set of URIs known for one HTTP service, plus the selection policy used to
/// round-robin or randomly pick among the healthy ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    RoundRobin,
    Random,
}

#[derive(Debug)]
pub struct ServiceUriBag {
    pub uris: Vec<FailureCountingUri>,
    pub policy: SelectionPolicy,
    round_robin_cursor: AtomicU32,
}

impl ServiceUriBag {
    pub fn new(uris: Vec<Url>, policy: SelectionPolicy) -> Self {
        ServiceUriBag {
            uris: uris.into_iter().map(FailureCountingUri::new).collect(),
            policy,
            round_robin_cursor: AtomicU32::new(0),
        }
    }

    /// Picks the next URI to dispatch to: a healthy one per `policy` if any exist,
    /// otherwise fails open onto the whole set (§4.6) rather than refusing the op. The
    /// fail-open branch also clears every URI's failure counter, so a transient
    /// cluster-wide outage doesn't leave the bag permanently stuck failing open even
    /// after the service recovers.
    pub fn select(&self, failed_threshold: u32, rehab_interval: Duration) -> Option<&FailureCountingUri> {
        if self.uris.is_empty() {
            return None;
        }
        let healthy: Vec<&FailureCountingUri> = self
            .uris
            .iter()
            .filter(|u| u.is_healthy(failed_threshold, rehab_interval))
            .collect();
        let pool = if healthy.is_empty() {
            for u in &self.uris {
                u.record_success();
            }
            self.uris.iter().collect()
        } else {
            healthy
        };

        match self.policy {
            SelectionPolicy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize % pool.len();
                Some(pool[idx])
            }
            SelectionPolicy::Random => {
                let idx = rand::random::<usize>() % pool.len();
                Some(pool[idx])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn healthy_under_threshold() {
        let u = FailureCountingUri::new(url("http://n1:8093"));
        u.record_failure();
        assert!(u.is_healthy(2, Duration::from_secs(30)));
    }

    #[test]
    fn unhealthy_once_threshold_crossed_and_interval_not_elapsed() {
        let u = FailureCountingUri::new(url("http://n1:8093"));
        u.record_failure();
        u.record_failure();
        assert!(!u.is_healthy(2, Duration::from_secs(30)));
    }

    #[test]
    fn select_fails_open_when_all_unhealthy() {
        let bag = ServiceUriBag::new(vec![url("http://n1:8093"), url("http://n2:8093")], SelectionPolicy::RoundRobin);
        for u in &bag.uris {
            u.record_failure();
            u.record_failure();
        }
        assert!(bag.select(2, Duration::from_secs(30)).is_some());
    }

    #[test]
    fn fail_open_clears_every_uris_failure_counter() {
        let bag = ServiceUriBag::new(vec![url("http://n1:8093"), url("http://n2:8093")], SelectionPolicy::RoundRobin);
        for u in &bag.uris {
            u.record_failure();
            u.record_failure();
        }
        bag.select(2, Duration::from_secs(30));
        for u in &bag.uris {
            assert_eq!(u.failure_count(), 0);
        }
    }

    #[test]
    fn round_robin_cycles_through_healthy_uris() {
        let bag = ServiceUriBag::new(vec![url("http://n1:8093"), url("http://n2:8093")], SelectionPolicy::RoundRobin);
        let first = bag.select(2, Duration::from_secs(30)).unwrap().uri.clone();
        let second = bag.select(2, Duration::from_secs(30)).unwrap().uri.clone();
        assert_ne!(first, second);
    }
}
