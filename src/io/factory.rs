//! Builds a node's IO Service from cluster configuration (§4.2, §4.3, §6): the piece
//! that turns a topology document's bare host/port pair into an authenticated, ready
//! to use `IoService`, either for a newly discovered node or to replay the same
//! bring-up sequence a reconfiguration's reused node skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::ClientConfig;
use tokio_util::codec::Framed;

use crate::cluster::node::DataEndpoint;
use crate::config::PoolConfiguration;
use crate::connection::handshake;
use crate::connection::pool::{ConnectionPool, NodeAuth};
use crate::connection::tls::{self, KeepaliveConfig};
use crate::error::Result;
use crate::protocol::FrameCodec;

use super::multiplexed::MultiplexedService;
use super::IoService;

/// Everything a bucket needs to stand up an `IoService` for any node in its cluster,
/// captured once at bucket-open time from `ClusterConfig` and reused for every node
/// discovered afterward by the config provider or a `NotMyVBucket` reconfiguration.
#[derive(Clone)]
pub struct IoServiceFactory {
    username: String,
    password: String,
    bucket: Option<String>,
    force_sasl_plain: bool,
    tls: Option<Arc<ClientConfig>>,
    pool_config: PoolConfiguration,
    use_connection_pooling: bool,
    keepalive: Option<KeepaliveConfig>,
    multiplex_high_water_mark: usize,
    multiplex_sweep_interval: Duration,
}

impl IoServiceFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        username: String,
        password: String,
        bucket: Option<String>,
        force_sasl_plain: bool,
        tls: Option<Arc<ClientConfig>>,
        pool_config: PoolConfiguration,
        use_connection_pooling: bool,
        keepalive: Option<KeepaliveConfig>,
        multiplex_high_water_mark: usize,
        multiplex_sweep_interval: Duration,
    ) -> Self {
        IoServiceFactory {
            username,
            password,
            bucket,
            force_sasl_plain,
            tls,
            pool_config,
            use_connection_pooling,
            keepalive,
            multiplex_high_water_mark,
            multiplex_sweep_interval,
        }
    }

    /// Dials, authenticates and (for pooled mode) eagerly warms `node_auth.bucket`'s
    /// share of `pool_config.min_size` connections for one node (§4.3).
    pub async fn build(&self, host: &str, data: &DataEndpoint, use_ssl: bool) -> Result<IoService> {
        let addr = if use_ssl { data.tls.unwrap_or(data.plain) } else { data.plain };
        let tls_config = if use_ssl { self.tls.clone() } else { None };
        let auth = NodeAuth {
            host: host.to_string(),
            addr,
            username: self.username.clone(),
            password: self.password.clone(),
            bucket: self.bucket.clone(),
            force_sasl_plain: self.force_sasl_plain,
            tls: tls_config.clone(),
        };

        if self.use_connection_pooling {
            let pool = ConnectionPool::new(auth, self.pool_config.clone(), self.keepalive);
            pool.initialize().await?;
            Ok(IoService::Pooled(pool))
        } else {
            let stream = tls::connect(host, addr, tls_config, self.keepalive).await?;
            let mut transport = Framed::new(stream, FrameCodec);
            handshake::hello(&mut transport, "vbucket-core").await?;
            let error_map = handshake::get_error_map(&mut transport).await.ok();
            handshake::authenticate(&mut transport, &self.username, &self.password, self.force_sasl_plain, error_map.as_ref()).await?;
            if let Some(bucket) = &self.bucket {
                handshake::select_bucket(&mut transport, bucket, error_map.as_ref()).await?;
            }
            let service = MultiplexedService::new(transport, self.multiplex_high_water_mark, self.multiplex_sweep_interval);
            Ok(IoService::Multiplexed(service))
        }
    }
}
