//! Bucket Facade (§2): the application-facing entry point. Consults the Key Mapper,
//! resolves the responsible node from the `ClusterView`, forwards the operation to
//! that node's IO Service, and retries on recoverable topology errors.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::cluster::node::Node;
use crate::cluster::ClusterView;
use crate::config::ClusterConfig;
use crate::config_provider::cccp;
use crate::config_provider::parser::{build_snapshot, TopologyDocument};
use crate::config_provider::ConfigProvider;
use crate::connection::handshake;
use crate::connection::tls::{self, KeepaliveConfig};
use crate::error::{CoreError, Result};
use crate::io;
use crate::io::factory::IoServiceFactory;
use crate::io::retry::backoff_for_attempt;
use crate::protocol::{Frame, FrameCodec, Opcode, Status};

/// The well-known binary-protocol data ports used to dial the very first node before
/// any topology document has been fetched (§4.3, §4.5's bootstrap path). Every node
/// discovered afterward carries its own `ports.direct`/`ports.sslDirect` from the
/// topology document instead.
const DEFAULT_PLAIN_PORT: u16 = 11210;
const DEFAULT_TLS_PORT: u16 = 11207;

/// Capacity and sweep cadence for a multiplexed bootstrap/node connection, shared by
/// every `IoServiceFactory` built from a `ClusterConfig` (§4.4's deadline-sweeping
/// inflight table has no configuration surface of its own).
const DEFAULT_MULTIPLEX_HIGH_WATER_MARK: usize = 1024;
const DEFAULT_MULTIPLEX_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// How often the background liveness prober issues a NoOp against quarantined nodes
/// (§4.4(b)).
const DEFAULT_LIVENESS_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// One data-path operation's outcome (§7's user-visible result shape), keeping the
/// server-supplied status and CAS even when the overall call failed.
pub struct OperationResult {
    pub success: bool,
    pub status: Option<Status>,
    pub cas: u64,
    pub value: bytes::Bytes,
}

/// Ties the Key Mapper, Cluster View and per-node IO Services together for one open
/// bucket. A node's IO Service lives on the `Node` itself so it survives
/// reconfiguration along with everything else about the node (§4.2); the Bucket
/// Facade re-resolves the node on every call rather than caching a reference, since a
/// reconfiguration can renumber or retire nodes between calls (§9's "re-resolves via
/// the view").
pub struct Bucket {
    view: Arc<ClusterView>,
    factory: IoServiceFactory,
    operation_lifespan: Duration,
    vbucket_retry_sleep_time: Duration,
    io_error_threshold: u32,
    io_error_check_interval: Duration,
    bootstrap_host: String,
    use_ssl: bool,
}

impl Bucket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: Arc<ClusterView>,
        factory: IoServiceFactory,
        operation_lifespan: Duration,
        vbucket_retry_sleep_time: Duration,
        io_error_threshold: u32,
        io_error_check_interval: Duration,
        bootstrap_host: String,
        use_ssl: bool,
    ) -> Self {
        Bucket {
            view,
            factory,
            operation_lifespan,
            vbucket_retry_sleep_time,
            io_error_threshold,
            io_error_check_interval,
            bootstrap_host,
            use_ssl,
        }
    }

    /// Bootstraps against `config.servers[0]`, fetches the initial topology document
    /// over a direct data connection, builds an `IoServiceFactory` from the bucket's
    /// credentials and transport settings, and spawns the background config-poll and
    /// liveness-probe tasks before handing back a ready-to-use `Bucket` (§1 scenario
    /// 1, §4.5's bootstrap).
    pub async fn open(config: &ClusterConfig, bucket_name: &str) -> Result<Bucket> {
        config.validate()?;

        let server = config
            .servers
            .first()
            .ok_or_else(|| CoreError::Config("servers must not be empty".into()))?;
        let bootstrap_host = server
            .host_str()
            .ok_or_else(|| CoreError::Config(format!("server URI {server} has no host")))?
            .to_string();

        let password = config
            .buckets
            .iter()
            .find(|b| b.name == bucket_name)
            .map(|b| b.password.clone())
            .unwrap_or_default();

        let tls_config = if config.use_ssl { Some(tls::client_tls_config(&config.tls)) } else { None };
        let keepalive = if config.enable_tcp_keep_alives {
            Some(KeepaliveConfig {
                time: config.tcp_keep_alive_time,
                interval: config.tcp_keep_alive_interval,
            })
        } else {
            None
        };

        let factory = IoServiceFactory::new(
            bucket_name.to_string(),
            password.clone(),
            Some(bucket_name.to_string()),
            config.force_sasl_plain,
            tls_config.clone(),
            config.pool.clone(),
            config.use_connection_pooling,
            keepalive,
            DEFAULT_MULTIPLEX_HIGH_WATER_MARK,
            DEFAULT_MULTIPLEX_SWEEP_INTERVAL,
        );

        let bootstrap_port = if config.use_ssl { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };
        let raw = fetch_topology_document(
            &bootstrap_host,
            bootstrap_port,
            tls_config.clone(),
            keepalive,
            bucket_name,
            &password,
            bucket_name,
            config.force_sasl_plain,
        )
        .await?;
        let doc = TopologyDocument::parse(&raw)?;
        let snapshot = build_snapshot(&doc, &bootstrap_host, config.use_ssl, None, &factory).await?;
        let view = Arc::new(ClusterView::new(snapshot));

        if config.config_poll_enabled {
            let poll_view = view.clone();
            let poll_host = bootstrap_host.clone();
            let poll_tls = tls_config.clone();
            let poll_username = bucket_name.to_string();
            let poll_password = password.clone();
            let poll_bucket = bucket_name.to_string();
            let poll_force_sasl_plain = config.force_sasl_plain;
            let poll_use_ssl = config.use_ssl;

            // Re-dials and re-authenticates on every poll tick rather than keeping a
            // dedicated long-lived bootstrap connection: simpler, and the poll
            // interval is measured in minutes so the extra handshake cost is noise.
            let provider = ConfigProvider::new(
                poll_view,
                poll_host.clone(),
                poll_use_ssl,
                config.config_poll_interval,
                config.config_poll_check_floor,
                factory.clone(),
                move || {
                    let host = poll_host.clone();
                    let tls = poll_tls.clone();
                    let username = poll_username.clone();
                    let password = poll_password.clone();
                    let bucket = poll_bucket.clone();
                    async move {
                        fetch_topology_document(&host, bootstrap_port, tls, keepalive, &username, &password, &bucket, poll_force_sasl_plain).await
                    }
                },
            );
            tokio::spawn(async move { provider.run().await });
        }

        tokio::spawn(io::probe::run(
            view.clone(),
            DEFAULT_LIVENESS_PROBE_INTERVAL,
            config.operation_lifespan,
            config.io_error_threshold,
            config.io_error_check_interval,
        ));

        Ok(Bucket::new(
            view,
            factory,
            config.operation_lifespan,
            config.vbucket_retry_sleep_time,
            config.io_error_threshold,
            config.io_error_check_interval,
            bootstrap_host,
            config.use_ssl,
        ))
    }

    /// Resolves a key to a live node, applying the random-live-node fallback when
    /// the mapped primary is negative, out of range, or marked down (§4.1).
    fn resolve_node(&self, key: &[u8]) -> Result<(u16, Arc<Node>)> {
        let snapshot = self.view.snapshot();
        let mapped = snapshot.key_mapper.map(key);

        let primary_ok = snapshot
            .node(mapped.primary)
            .filter(|n| !n.is_down())
            .cloned();

        let node = match primary_ok {
            Some(node) => node,
            None => {
                let live: Vec<&Arc<Node>> = snapshot.nodes.iter().filter(|n| !n.is_down()).collect();
                let chosen = live
                    .choose(&mut rand::thread_rng())
                    .ok_or(CoreError::NoAvailableNode)?;
                (*chosen).clone()
            }
        };

        Ok((mapped.partition_id, node))
    }

    /// Executes one operation end to end: map the key, dispatch, and retry against
    /// the freshly installed topology when the server answers `NotMyVBucket`,
    /// `Busy`, or `TemporaryFailure`, honoring `operation_lifespan` as the overall
    /// deadline regardless of how many attempts that takes (§4.4 retry policy).
    pub async fn execute(&self, opcode: Opcode, key: &[u8], extras: bytes::Bytes, value: bytes::Bytes, cas: u64) -> Result<OperationResult> {
        let deadline = tokio::time::Instant::now() + self.operation_lifespan;
        let mut attempt = 0u32;

        loop {
            let (partition_id, node) = self.resolve_node(key)?;
            let io_service = node.io.clone();

            let mut request = Frame::request(opcode, partition_id, 0, cas);
            request.extras = extras.clone();
            request.key = bytes::Bytes::copy_from_slice(key);
            request.value = value.clone();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::OperationTimeout(self.operation_lifespan));
            }

            let outcome = io_service
                .execute(&node, request, remaining, self.io_error_threshold, self.io_error_check_interval)
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if let Some(body) = status.filter(|s| *s == Status::NotMyVBucket).map(|_| response.value.clone()) {
                        self.handle_not_my_vbucket(&body).await;
                    }
                    if status == Some(Status::Success) {
                        return Ok(OperationResult {
                            success: true,
                            status,
                            cas: response.cas,
                            value: response.value,
                        });
                    }
                    if status.is_some_and(|s| matches!(s, Status::NotMyVBucket | Status::Busy | Status::TemporaryFailure)) {
                        attempt += 1;
                        debug!(attempt, ?status, "retrying after recoverable server status");
                        tokio::time::sleep(backoff_for_attempt(self.vbucket_retry_sleep_time, attempt).min(remaining)).await;
                        continue;
                    }
                    return Ok(OperationResult {
                        success: false,
                        status,
                        cas: response.cas,
                        value: response.value,
                    });
                }
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    debug!(attempt, error = %err, "retrying after transport-level error");
                    tokio::time::sleep(backoff_for_attempt(self.vbucket_retry_sleep_time, attempt).min(remaining)).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A `NotMyVBucket` response commonly carries an updated topology document in
    /// its body; install it immediately rather than waiting for the next poll cycle
    /// (§4.4). Reuses nodes the new document shares with the current view (§4.2)
    /// rather than rebuilding the whole roster from scratch.
    async fn handle_not_my_vbucket(&self, body: &[u8]) {
        let Ok(text) = std::str::from_utf8(body) else { return };
        let Ok(doc) = TopologyDocument::parse(text) else { return };
        if doc.revision() <= self.view.revision() {
            return;
        }
        let previous = self.view.snapshot();
        if let Ok(snapshot) = build_snapshot(&doc, &self.bootstrap_host, self.use_ssl, Some(previous.as_ref()), &self.factory).await {
            self.view.reconfigure(snapshot);
        }
    }
}

/// Dials a node directly (bypassing any `IoService`), authenticates, selects
/// `bucket`, and issues one `GetClusterConfig` (§4.5's bootstrap and CCCP polling
/// paths share this exact bring-up sequence).
#[allow(clippy::too_many_arguments)]
async fn fetch_topology_document(
    host: &str,
    port: u16,
    tls_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    keepalive: Option<KeepaliveConfig>,
    username: &str,
    password: &str,
    bucket: &str,
    force_sasl_plain: bool,
) -> Result<String> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| CoreError::ConnectFailed(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| CoreError::ConnectFailed(format!("{host}:{port} did not resolve to any address")))?;

    let stream = tls::connect(host, addr, tls_config, keepalive).await?;
    let mut transport = Framed::new(stream, FrameCodec);

    handshake::hello(&mut transport, "vbucket-core").await?;
    let error_map = handshake::get_error_map(&mut transport).await.ok();
    handshake::authenticate(&mut transport, username, password, force_sasl_plain, error_map.as_ref()).await?;
    handshake::select_bucket(&mut transport, bucket, error_map.as_ref()).await?;

    let body = cccp::fetch(&mut transport).await?;
    String::from_utf8(body.to_vec()).map_err(|e| CoreError::Serialization(format!("invalid UTF-8 in topology document: {e}")))
}
