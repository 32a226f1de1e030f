//! Defines the primary error type for the data-path router core.

use std::sync::Arc;
use thiserror::Error;

use crate::protocol::Status;

/// The main error enum, covering the taxonomy in the transport/auth/routing/server/client
/// classes. `thiserror` gives us `Display` plus the `From` impls below for free conversion
/// at I/O and parsing boundaries.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // --- Transport ---
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("operation timed out after {0:?}")]
    OperationTimeout(std::time::Duration),

    #[error("connection pool exhausted (waited {0:?})")]
    ConnectionPoolExhausted(std::time::Duration),

    // --- Auth ---
    #[error("SASL authentication rejected: {0}")]
    SaslRejected(String),

    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    // --- Routing ---
    #[error("no live data node available")]
    NoAvailableNode,

    #[error("vbucket not owned by the node that was asked (partition {partition})")]
    NotMyVBucket { partition: u16 },

    #[error("node is quarantined: {0}")]
    NodeQuarantined(String),

    // --- Server ---
    #[error("server status {status:?}{message}", message = .error_map_text.as_ref().map(|t| format!(": {t}")).unwrap_or_default())]
    ServerStatus {
        status: Status,
        error_map_text: Option<String>,
    },

    // --- Client ---
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("http client error: {0}")]
    HttpClientError(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the spec's retry policy says to retry this error locally within the
    /// operation's deadline (`NotMyVBucket`, `Busy`, `TemporaryFailure`, transport errors),
    /// as opposed to surfacing it immediately (auth errors, permanent server statuses).
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::ConnectFailed(_)
            | CoreError::Io(_)
            | CoreError::OperationTimeout(_)
            | CoreError::ConnectionPoolExhausted(_)
            | CoreError::NotMyVBucket { .. }
            | CoreError::NodeQuarantined(_) => true,
            CoreError::ServerStatus { status, .. } => {
                matches!(status, Status::Busy | Status::TemporaryFailure | Status::NotMyVBucket)
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::HttpClientError(e.to_string())
    }
}

impl From<rustls::Error> for CoreError {
    fn from(e: rustls::Error) -> Self {
        CoreError::TlsHandshakeFailed(e.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl From<url::ParseError> for CoreError {
    fn from(e: url::ParseError) -> Self {
        CoreError::Config(format!("invalid URI: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
