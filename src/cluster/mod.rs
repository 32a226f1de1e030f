//! Cluster View: the node roster, partition table, key mapper and HTTP service URI
//! bags for one bucket, replaced wholesale on every reconfiguration (§3, §4.2).

pub mod node;
pub mod partition;
pub mod service_uri;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::key_mapper::KeyMapper;
use node::Node;
use service_uri::ServiceUriBag;

/// One immutable, fully-formed view of the cluster topology for a bucket. A
/// reconfiguration builds a brand new `ClusterSnapshot` off the decode path and hands
/// it to `ClusterView::reconfigure`; nothing in this type is ever mutated after
/// construction, so any `Arc<ClusterSnapshot>` handed out to an in-flight operation
/// stays internally consistent even if the view moves on underneath it.
#[derive(Debug)]
pub struct ClusterSnapshot {
    pub revision: u64,
    pub nodes: Vec<Arc<Node>>,
    pub key_mapper: KeyMapper,
    pub query_uris: ServiceUriBag,
    pub analytics_uris: ServiceUriBag,
    pub search_uris: ServiceUriBag,
    pub view_uris: ServiceUriBag,
}

impl ClusterSnapshot {
    pub fn node(&self, index: i32) -> Option<&Arc<Node>> {
        if index < 0 {
            return None;
        }
        self.nodes.get(index as usize)
    }
}

/// The bucket's live cluster state: a single `RwLock`-protected pointer swapped on
/// reconfiguration (§4.2). Reads (the overwhelming majority of accesses — every
/// key-mapped operation reads the current snapshot once) take a read lock just long
/// enough to clone the `Arc`; the snapshot itself is consulted lock-free afterward.
#[derive(Debug)]
pub struct ClusterView {
    current: RwLock<Arc<ClusterSnapshot>>,
}

impl ClusterView {
    pub fn new(initial: ClusterSnapshot) -> Self {
        ClusterView {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.current.read().clone()
    }

    /// Installs `next` only if its revision is newer than the currently installed
    /// snapshot's, so a reordered or duplicate config push can never roll the view
    /// backward (§4.2, §4.5). Returns whether the swap happened.
    pub fn reconfigure(&self, next: ClusterSnapshot) -> bool {
        let mut guard = self.current.write();
        if next.revision <= guard.revision {
            return false;
        }
        *guard = Arc::new(next);
        true
    }

    pub fn revision(&self) -> u64 {
        self.current.read().revision
    }

    /// A point-in-time readout of each node's health state, for operators and tests
    /// to inspect without reaching into the snapshot's internals (§4.4(b)).
    pub fn diagnostics(&self) -> ClusterDiagnostics {
        let snapshot = self.snapshot();
        ClusterDiagnostics {
            revision: snapshot.revision,
            nodes: snapshot
                .nodes
                .iter()
                .map(|n| NodeDiagnostics {
                    host: n.host.clone(),
                    down: n.is_down(),
                    failure_count: n.failure_count(),
                })
                .collect(),
        }
    }
}

/// Snapshot of cluster health for diagnostics, returned by `ClusterView::diagnostics`.
#[derive(Debug, Clone)]
pub struct ClusterDiagnostics {
    pub revision: u64,
    pub nodes: Vec<NodeDiagnostics>,
}

#[derive(Debug, Clone)]
pub struct NodeDiagnostics {
    pub host: String,
    pub down: bool,
    pub failure_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::partition::PartitionTable;
    use service_uri::SelectionPolicy;

    fn empty_snapshot(revision: u64) -> ClusterSnapshot {
        ClusterSnapshot {
            revision,
            nodes: Vec::new(),
            key_mapper: KeyMapper::Couchbase(PartitionTable::empty()),
            query_uris: ServiceUriBag::new(vec![], SelectionPolicy::RoundRobin),
            analytics_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
            search_uris: ServiceUriBag::new(vec![], SelectionPolicy::Random),
            view_uris: ServiceUriBag::new(vec![], SelectionPolicy::RoundRobin),
        }
    }

    #[test]
    fn reconfigure_accepts_a_strictly_newer_revision() {
        let view = ClusterView::new(empty_snapshot(1));
        assert!(view.reconfigure(empty_snapshot(2)));
        assert_eq!(view.revision(), 2);
    }

    #[test]
    fn reconfigure_rejects_stale_or_equal_revisions() {
        let view = ClusterView::new(empty_snapshot(5));
        assert!(!view.reconfigure(empty_snapshot(5)));
        assert!(!view.reconfigure(empty_snapshot(3)));
        assert_eq!(view.revision(), 5);
    }

    #[test]
    fn snapshot_taken_before_reconfigure_stays_consistent() {
        let view = ClusterView::new(empty_snapshot(1));
        let before = view.snapshot();
        view.reconfigure(empty_snapshot(2));
        assert_eq!(before.revision, 1);
        assert_eq!(view.snapshot().revision, 2);
    }

    #[test]
    fn diagnostics_reports_current_revision_with_no_nodes() {
        let view = ClusterView::new(empty_snapshot(7));
        let diag = view.diagnostics();
        assert_eq!(diag.revision, 7);
        assert!(diag.nodes.is_empty());
    }
}
