//! Background liveness probing for quarantined nodes (§4.4(b)): a periodic NoOp
//! against every node currently marked down, so a node can recover on its own
//! traffic rather than waiting for the next reconfiguration or a lucky retry that
//! happens to land on it.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::ClusterView;
use crate::protocol::{Frame, Opcode};

/// Issues one NoOp against each node the current snapshot has marked down. A
/// successful reply clears the node's health counters via the same
/// `IoService::execute`/`retry::record_outcome` path ordinary traffic uses; a failed
/// probe just extends the existing quarantine.
pub async fn probe_down_nodes(view: &ClusterView, timeout: Duration, io_error_threshold: u32, io_error_check_interval: Duration) {
    let snapshot = view.snapshot();
    for node in &snapshot.nodes {
        if !node.is_down() {
            continue;
        }
        let request = Frame::request(Opcode::NoOp, 0, 0, 0);
        let outcome = node.io.execute(node, request, timeout, io_error_threshold, io_error_check_interval).await;
        debug!(host = %node.host, ok = outcome.is_ok(), "liveness probe against quarantined node");
    }
}

/// Runs `probe_down_nodes` on `interval` until cancelled. Intended to be spawned as a
/// background task alongside bucket open, mirroring the config provider's poll loop.
pub async fn run(view: Arc<ClusterView>, interval: Duration, timeout: Duration, io_error_threshold: u32, io_error_check_interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tick.tick().await;
        probe_down_nodes(&view, timeout, io_error_threshold, io_error_check_interval).await;
    }
}
