//! Cluster-state-aware data-path router and binary protocol core for a
//! Couchbase-style client SDK: key mapping, cluster topology tracking, pooled and
//! multiplexed connection dispatch, topology streaming, and the HTTP query
//! dispatcher that shares its health-tracking policy with the data path.

pub mod bucket;
pub mod cluster;
pub mod config;
pub mod config_provider;
pub mod connection;
pub mod error;
pub mod http;
pub mod io;
pub mod key_mapper;
pub mod protocol;
pub mod telemetry;

pub use bucket::{Bucket, OperationResult};
pub use cluster::{ClusterSnapshot, ClusterView};
pub use config::ClusterConfig;
pub use error::{CoreError, Result};
