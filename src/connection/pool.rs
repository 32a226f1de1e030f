//! A bounded, per-node pool of authenticated data connections (§4.3): dial, TLS,
//! HELLO, SASL, SelectBucket on bring-up; idle reclamation down to `min_size`;
//! semaphore-backed backpressure on `acquire`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::codec::Framed;
use tracing::{info, warn};

use bytes::Bytes;

use crate::config::PoolConfiguration;
use crate::connection::handshake::{self, HelloFeature, Transport};
use crate::connection::tls::{self, KeepaliveConfig};
use crate::error::{CoreError, Result};
use crate::protocol::FrameCodec;

/// Credentials and topology details a pool needs to bring a connection all the way
/// up to "ready for data-path traffic".
#[derive(Debug, Clone)]
pub struct NodeAuth {
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
    pub bucket: Option<String>,
    pub force_sasl_plain: bool,
    pub tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

/// An authenticated connection checked out of the pool. Dropping it without calling
/// `ConnectionPool::release` simply loses the permit's backing connection; the pool
/// treats that the same as a disposal (the semaphore permit itself is always
/// returned via RAII, so pool capacity never leaks).
pub struct Connection {
    pub transport: Transport,
    /// The HELLO features the server acknowledged (§3, §4.3).
    pub features: Vec<HelloFeature>,
    /// The server's error map, fetched once at bring-up and cached for the life of
    /// the connection so a later `ServerStatus` error can carry a description (§4.3).
    pub error_map: Option<Bytes>,
    idle_since: Instant,
}

struct Idle {
    connections: VecDeque<Connection>,
}

/// The pool for one node. `max_size` permits gate concurrent checkouts; the idle
/// deque underneath holds connections not currently in a caller's hands, up to
/// `max_size` of them (checked-out connections hold a permit but no deque slot).
pub struct ConnectionPool {
    auth: NodeAuth,
    config: PoolConfiguration,
    keepalive: Option<KeepaliveConfig>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Idle>,
    total_created: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(auth: NodeAuth, config: PoolConfiguration, keepalive: Option<KeepaliveConfig>) -> Self {
        ConnectionPool {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Idle {
                connections: VecDeque::new(),
            }),
            total_created: AtomicUsize::new(0),
            auth,
            config,
            keepalive,
        }
    }

    /// Dials `min_size` connections eagerly so the first caller-visible operation
    /// doesn't pay a cold-dial cost.
    pub async fn initialize(&self) -> Result<()> {
        for _ in 0..self.config.min_size {
            let conn = self.dial_and_authenticate().await?;
            self.idle.lock().connections.push_back(conn);
        }
        Ok(())
    }

    async fn dial_and_authenticate(&self) -> Result<Connection> {
        let stream = tls::connect(&self.auth.host, self.auth.addr, self.auth.tls.clone(), self.keepalive).await?;
        let mut transport = Framed::new(stream, FrameCodec);

        let features = handshake::hello(&mut transport, "vbucket-core").await?;
        let error_map = handshake::get_error_map(&mut transport).await.ok();
        handshake::authenticate(
            &mut transport,
            &self.auth.username,
            &self.auth.password,
            self.auth.force_sasl_plain,
            error_map.as_ref(),
        )
        .await?;
        if let Some(bucket) = &self.auth.bucket {
            handshake::select_bucket(&mut transport, bucket, error_map.as_ref()).await?;
        }

        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(Connection {
            transport,
            features,
            error_map,
            idle_since: Instant::now(),
        })
    }

    /// Checks out a connection, blocking up to `PoolConfiguration.wait_timeout`
    /// before failing with `ConnectionPoolExhausted` (§4.3).
    pub async fn acquire(&self) -> Result<PooledCheckout<'_>> {
        let permit = tokio::time::timeout(self.config.wait_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| CoreError::ConnectionPoolExhausted(self.config.wait_timeout))?
            .expect("semaphore is never closed while the pool is alive");

        let existing = {
            let mut idle = self.idle.lock();
            idle.connections.pop_front()
        };

        let connection = match existing {
            Some(conn) => conn,
            None => self.dial_and_authenticate().await?,
        };

        Ok(PooledCheckout {
            pool: self,
            connection: Some(connection),
            _permit: permit,
        })
    }

    fn release(&self, mut connection: Connection) {
        connection.idle_since = Instant::now();
        let mut idle = self.idle.lock();
        if idle.connections.len() < self.config.max_size {
            idle.connections.push_back(connection);
        }
    }

    /// Closes idle connections that have sat unused longer than `idle_timeout`,
    /// never dropping below `min_size` (§4.3).
    pub fn reap_idle(&self) {
        let mut idle = self.idle.lock();
        let now = Instant::now();
        while idle.connections.len() > self.config.min_size {
            let Some(front) = idle.connections.front() else { break };
            if now.duration_since(front.idle_since) <= self.config.idle_timeout {
                break;
            }
            idle.connections.pop_front();
        }
    }

    /// Drains in-flight work up to `shutdown_timeout` before dropping every
    /// connection, in-flight or idle (§AMBIENT STACK graceful shutdown).
    pub async fn dispose(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        while self.semaphore.available_permits() < self.config.max_size && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.semaphore.available_permits() < self.config.max_size {
            warn!(node = %self.auth.host, "pool disposed with operations still in flight past shutdown_timeout");
        }
        info!(node = %self.auth.host, "connection pool disposed");
        self.idle.lock().connections.clear();
    }
}

/// An RAII checkout: returns the connection to the pool's idle deque on drop unless
/// `discard` was called (authentication/transport failure on this connection).
pub struct PooledCheckout<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Connection>,
    _permit: SemaphorePermit<'a>,
}

impl<'a> PooledCheckout<'a> {
    pub fn transport(&mut self) -> &mut Transport {
        &mut self.connection.as_mut().expect("connection present until drop or discard").transport
    }

    /// Marks this connection as unusable; it will not be returned to the pool.
    pub fn discard(mut self) {
        self.connection = None;
    }
}

impl Drop for PooledCheckout<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.auth.host)
            .field("min_size", &self.config.min_size)
            .field("max_size", &self.config.max_size)
            .field("idle", &self.idle.lock().connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_respects_min_size_even_when_expired() {
        // This exercises the bookkeeping path without a real socket: an empty pool
        // with min_size == 0 has nothing to reap, and reap_idle must not panic on an
        // empty deque.
        let pool = ConnectionPool::new(
            NodeAuth {
                host: "node1".into(),
                addr: "127.0.0.1:11210".parse().unwrap(),
                username: "default".into(),
                password: String::new(),
                bucket: None,
                force_sasl_plain: false,
                tls: None,
            },
            PoolConfiguration {
                min_size: 0,
                max_size: 4,
                wait_timeout: Duration::from_secs(1),
                shutdown_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_secs(30),
            },
            None,
        );
        pool.reap_idle();
        assert_eq!(pool.idle.lock().connections.len(), 0);
    }
}
