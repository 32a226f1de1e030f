//! Plain vs TLS transport selection for a data connection (§4.3), following the same
//! enum-over-`AsyncRead`/`AsyncWrite` shape used for the replica link this crate's
//! connection pool is modeled on.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::error::{CoreError, Result};

/// TCP keep-alive tuning applied to every dialed data connection (§4.3, §6
/// `EnableTcpKeepAlives`/`TcpKeepAliveTime`/`TcpKeepAliveInterval`).
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    pub time: Duration,
    pub interval: Duration,
}

/// A data connection's transport: plain TCP or a TLS stream wrapping one. Both sides
/// of the `AsyncRead`/`AsyncWrite` impls simply delegate to the active variant so
/// callers above the transport layer never need to match on it.
pub enum DataStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DataStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A verifier that accepts any certificate chain, installed only when
/// `TlsConfig.enable_certificate_authentication` is explicitly disabled.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds the client TLS configuration from `TlsConfig` (§6): the root store always
/// ships the `webpki-roots` bundle, and the whole chain-of-trust check is swapped out
/// for a no-op verifier when `enable_certificate_authentication` is off — the common
/// escape hatch for internal clusters running a self-signed or unmanaged CA.
///
/// `enable_certificate_revocation` and `ignore_remote_certificate_name_mismatch` are
/// accepted but not yet wired to anything: rustls ships no bundled CRL/OCSP source to
/// hang the former off, and no built-in "verify chain, skip hostname" verifier for the
/// latter without reimplementing `WebPkiServerVerifier` by hand.
pub fn client_tls_config(tls: &TlsConfig) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !tls.enable_certificate_authentication {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Arc::new(config)
}

fn apply_keepalive(stream: &TcpStream, keepalive: KeepaliveConfig) -> std::io::Result<()> {
    let params = TcpKeepalive::new()
        .with_time(keepalive.time)
        .with_interval(keepalive.interval);
    SockRef::from(stream).set_tcp_keepalive(&params)
}

pub async fn connect(
    host: &str,
    addr: SocketAddr,
    tls: Option<Arc<ClientConfig>>,
    keepalive: Option<KeepaliveConfig>,
) -> Result<DataStream> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| CoreError::ConnectFailed(format!("{addr}: {e}")))?;
    tcp.set_nodelay(true).ok();
    if let Some(ka) = keepalive {
        apply_keepalive(&tcp, ka).ok();
    }

    match tls {
        None => Ok(DataStream::Tcp(tcp)),
        Some(config) => {
            let connector = TlsConnector::from(config);
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|e| CoreError::TlsHandshakeFailed(format!("invalid server name {host}: {e}")))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
            Ok(DataStream::Tls(Box::new(stream)))
        }
    }
}
