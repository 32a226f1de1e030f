//! IO Service: pooled and multiplexed request dispatch over a node's connections,
//! with deadline handling, retry backoff and per-node health accounting (§4.4).

pub mod factory;
pub mod multiplexed;
pub mod pooled;
pub mod probe;
pub mod retry;

use std::time::Duration;

use crate::cluster::node::Node;
use crate::connection::ConnectionPool;
use crate::error::Result;
use crate::protocol::Frame;
use multiplexed::MultiplexedService;

/// Which dispatch mode a node's IO Service uses, selected once at bucket-open time
/// from `UseConnectionPooling` (§6) and never mixed thereafter.
pub enum IoService {
    Pooled(ConnectionPool),
    Multiplexed(MultiplexedService),
}

impl IoService {
    /// Executes one operation against `node` and folds the outcome into its health
    /// counters (§4.4's per-node health tracking), independent of dispatch mode.
    pub async fn execute(
        &self,
        node: &Node,
        request: Frame,
        deadline: Duration,
        io_error_threshold: u32,
        io_error_check_interval: Duration,
    ) -> Result<Frame> {
        let outcome = match self {
            IoService::Pooled(pool) => pooled::execute(pool, request, deadline).await,
            IoService::Multiplexed(service) => service.execute(request, deadline).await,
        };
        let health_result = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
        retry::record_outcome(node, &health_result, io_error_threshold, io_error_check_interval);
        outcome
    }

    /// Releases the resources backing this IO Service: drains in-flight pooled
    /// connections (§AMBIENT STACK graceful shutdown); a multiplexed connection's
    /// background tasks are aborted on `Drop` once the last `Arc<Node>` referencing
    /// it goes away, so there's nothing proactive to do for that variant.
    pub async fn dispose(&self) {
        if let IoService::Pooled(pool) = self {
            pool.dispose().await;
        }
    }
}
