//! Configuration surface (§6): deserialized from TOML via `serde`, following the
//! raw-struct-plus-defaults-plus-validate shape used throughout this codebase.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, Result};

fn default_servers() -> Vec<Url> {
    vec![Url::parse("http://localhost:8091").unwrap()]
}

fn default_pool_min_size() -> usize {
    1
}

fn default_pool_max_size() -> usize {
    10
}

fn default_pool_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_operation_lifespan() -> Duration {
    Duration::from_millis(2_500)
}

fn default_view_request_timeout() -> Duration {
    Duration::from_secs(75)
}

fn default_query_request_timeout() -> Duration {
    Duration::from_secs(75)
}

fn default_search_request_timeout() -> Duration {
    Duration::from_secs(75)
}

fn default_analytics_request_timeout() -> Duration {
    Duration::from_secs(75)
}

fn default_vbucket_retry_sleep_time() -> Duration {
    Duration::from_millis(100)
}

fn default_io_error_threshold() -> u32 {
    5
}

fn default_io_error_check_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_query_failed_threshold() -> u32 {
    2
}

fn default_config_poll_enabled() -> bool {
    true
}

fn default_config_poll_interval() -> Duration {
    Duration::from_secs(2500)
}

fn default_config_poll_check_floor() -> Duration {
    Duration::from_millis(50)
}

fn default_true() -> bool {
    true
}

fn default_tcp_keep_alive_time() -> Duration {
    Duration::from_secs(60)
}

fn default_tcp_keep_alive_interval() -> Duration {
    Duration::from_secs(1)
}

/// Per-node connection pool bounds (§6 `PoolConfiguration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfiguration {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_pool_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,
    #[serde(default = "default_pool_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_pool_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        PoolConfiguration {
            min_size: default_pool_min_size(),
            max_size: default_pool_max_size(),
            wait_timeout: default_pool_wait_timeout(),
            shutdown_timeout: default_pool_shutdown_timeout(),
            idle_timeout: default_pool_idle_timeout(),
        }
    }
}

/// Credentials for one bucket, used when the cluster isn't using a single
/// cluster-wide password (§6 `Buckets[*].Name/Password`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
}

/// TLS behavior knobs (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enable_certificate_authentication: bool,
    #[serde(default)]
    pub enable_certificate_revocation: bool,
    #[serde(default)]
    pub ignore_remote_certificate_name_mismatch: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enable_certificate_authentication: true,
            enable_certificate_revocation: false,
            ignore_remote_certificate_name_mismatch: false,
        }
    }
}

/// The top-level cluster configuration (§6), loaded from a TOML file or string and
/// validated before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default = "default_servers")]
    pub servers: Vec<Url>,
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
    #[serde(default)]
    pub pool: PoolConfiguration,

    #[serde(default = "default_view_request_timeout", with = "humantime_serde")]
    pub view_request_timeout: Duration,
    #[serde(default = "default_query_request_timeout", with = "humantime_serde")]
    pub query_request_timeout: Duration,
    #[serde(default = "default_search_request_timeout", with = "humantime_serde")]
    pub search_request_timeout: Duration,
    #[serde(default = "default_analytics_request_timeout", with = "humantime_serde")]
    pub analytics_request_timeout: Duration,
    #[serde(default = "default_operation_lifespan", with = "humantime_serde")]
    pub operation_lifespan: Duration,

    #[serde(default = "default_vbucket_retry_sleep_time", with = "humantime_serde")]
    pub vbucket_retry_sleep_time: Duration,
    #[serde(default = "default_io_error_threshold")]
    pub io_error_threshold: u32,
    #[serde(default = "default_io_error_check_interval", with = "humantime_serde")]
    pub io_error_check_interval: Duration,
    #[serde(default = "default_query_failed_threshold")]
    pub query_failed_threshold: u32,

    #[serde(default = "default_config_poll_enabled")]
    pub config_poll_enabled: bool,
    #[serde(default = "default_config_poll_interval", with = "humantime_serde")]
    pub config_poll_interval: Duration,
    #[serde(default = "default_config_poll_check_floor", with = "humantime_serde")]
    pub config_poll_check_floor: Duration,

    #[serde(default = "default_true")]
    pub enable_tcp_keep_alives: bool,
    #[serde(default = "default_tcp_keep_alive_time", with = "humantime_serde")]
    pub tcp_keep_alive_time: Duration,
    #[serde(default = "default_tcp_keep_alive_interval", with = "humantime_serde")]
    pub tcp_keep_alive_interval: Duration,

    #[serde(default)]
    pub force_sasl_plain: bool,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_true")]
    pub use_connection_pooling: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            use_ssl: false,
            servers: default_servers(),
            buckets: Vec::new(),
            pool: PoolConfiguration::default(),
            view_request_timeout: default_view_request_timeout(),
            query_request_timeout: default_query_request_timeout(),
            search_request_timeout: default_search_request_timeout(),
            analytics_request_timeout: default_analytics_request_timeout(),
            operation_lifespan: default_operation_lifespan(),
            vbucket_retry_sleep_time: default_vbucket_retry_sleep_time(),
            io_error_threshold: default_io_error_threshold(),
            io_error_check_interval: default_io_error_check_interval(),
            query_failed_threshold: default_query_failed_threshold(),
            config_poll_enabled: default_config_poll_enabled(),
            config_poll_interval: default_config_poll_interval(),
            config_poll_check_floor: default_config_poll_check_floor(),
            enable_tcp_keep_alives: true,
            tcp_keep_alive_time: default_tcp_keep_alive_time(),
            tcp_keep_alive_interval: default_tcp_keep_alive_interval(),
            force_sasl_plain: false,
            tls: TlsConfig::default(),
            use_connection_pooling: true,
        }
    }
}

impl ClusterConfig {
    pub fn from_str(raw: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    /// Cross-field sanity checks the TOML deserializer alone can't express.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(CoreError::Config("servers must not be empty".into()));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(CoreError::Config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.max_size == 0 {
            return Err(CoreError::Config("pool.max_size must be non-zero".into()));
        }
        if self.query_failed_threshold == 0 {
            return Err(CoreError::Config("query_failed_threshold must be non-zero".into()));
        }
        if self.io_error_threshold == 0 {
            return Err(CoreError::Config("io_error_threshold must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_servers_list_is_rejected() {
        let mut config = ClusterConfig::default();
        config.servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_size_above_max_size_is_rejected() {
        let mut config = ClusterConfig::default();
        config.pool.min_size = 20;
        config.pool.max_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_overrides_from_toml() {
        let raw = r#"
            use_ssl = true
            servers = ["http://node1:8091"]
            io_error_threshold = 3
        "#;
        let config = ClusterConfig::from_str(raw).unwrap();
        assert!(config.use_ssl);
        assert_eq!(config.servers[0].host_str(), Some("node1"));
        assert_eq!(config.io_error_threshold, 3);
        assert_eq!(config.pool.max_size, default_pool_max_size());
    }
}
