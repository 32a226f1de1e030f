//! Connection bring-up: HELLO feature negotiation, error-map retrieval, SASL
//! authentication and SelectBucket (§4.3).

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::connection::sasl::{plain_message, Mechanism, ScramClient};
use crate::connection::tls::DataStream;
use crate::error::{CoreError, Result};
use crate::protocol::{Frame, FrameCodec, Magic, Opcode, Status};

/// Optional features requested during HELLO, matching §4.3's list. Each is a 2-byte
/// big-endian feature code in the request body; the response body echoes the subset
/// the server actually supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HelloFeature {
    ErrorMap,
    SelectBucket,
    Snappy,
    TcpNoDelay,
    EnhancedDurability,
    SubdocXattr,
    Tracing,
}

impl HelloFeature {
    const fn code(self) -> u16 {
        match self {
            HelloFeature::TcpNoDelay => 0x03,
            HelloFeature::EnhancedDurability => 0x05,
            HelloFeature::Snappy => 0x0a,
            HelloFeature::SubdocXattr => 0x11,
            HelloFeature::SelectBucket => 0x12,
            HelloFeature::ErrorMap => 0x07,
            HelloFeature::Tracing => 0x19,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x03 => HelloFeature::TcpNoDelay,
            0x05 => HelloFeature::EnhancedDurability,
            0x0a => HelloFeature::Snappy,
            0x11 => HelloFeature::SubdocXattr,
            0x12 => HelloFeature::SelectBucket,
            0x07 => HelloFeature::ErrorMap,
            0x19 => HelloFeature::Tracing,
            _ => return None,
        })
    }
}

pub const DEFAULT_FEATURES: &[HelloFeature] = &[
    HelloFeature::ErrorMap,
    HelloFeature::SelectBucket,
    HelloFeature::Snappy,
    HelloFeature::TcpNoDelay,
    HelloFeature::EnhancedDurability,
    HelloFeature::SubdocXattr,
    HelloFeature::Tracing,
];

pub type Transport = Framed<DataStream, FrameCodec>;

async fn roundtrip(transport: &mut Transport, request: Frame) -> Result<Frame> {
    transport.send(request).await?;
    transport
        .next()
        .await
        .ok_or_else(|| CoreError::ConnectFailed("connection closed during handshake".into()))?
}

/// Sends HELLO with `DEFAULT_FEATURES` (plus the opaque client identifier) and
/// returns the subset the server acknowledged.
pub async fn hello(transport: &mut Transport, agent: &str) -> Result<Vec<HelloFeature>> {
    let mut value = BytesMut::new();
    for feature in DEFAULT_FEATURES {
        value.put_u16(feature.code());
    }

    let request = Frame {
        magic: Magic::Request,
        opcode: Opcode::Hello,
        datatype: 0,
        vbucket_or_status: 0,
        opaque: 0,
        cas: 0,
        extras: Bytes::new(),
        key: Bytes::copy_from_slice(agent.as_bytes()),
        value: value.freeze(),
    };
    let response = roundtrip(transport, request).await?;
    check_status(&response, Opcode::Hello, None)?;

    let mut negotiated = Vec::new();
    let mut chunks = response.value.chunks_exact(2);
    for chunk in &mut chunks {
        let code = u16::from_be_bytes([chunk[0], chunk[1]]);
        match HelloFeature::from_code(code) {
            Some(feature) => negotiated.push(feature),
            None => debug!(code, "server acknowledged an unrecognized HELLO feature code"),
        }
    }
    Ok(negotiated)
}

/// Retrieves and returns the raw JSON error map body (§4.3); callers cache it
/// alongside the connection for richer server-error diagnostics.
pub async fn get_error_map(transport: &mut Transport) -> Result<Bytes> {
    let mut request = Frame::request(Opcode::GetErrorMap, 0, 0, 0);
    request.value = Bytes::from_static(&[0, 2]);
    let response = roundtrip(transport, request).await?;
    check_status(&response, Opcode::GetErrorMap, None)?;
    Ok(response.value)
}

/// Looks up a status code's description in a cached error map (§4.3). Couchbase error
/// maps key their `errors` object by the status code formatted as a lowercase hex
/// string (`"0x23"`); codes the map doesn't describe simply have no entry.
pub fn lookup_error_text(error_map: &[u8], status: Status) -> Option<String> {
    let map: serde_json::Value = serde_json::from_slice(error_map).ok()?;
    let key = format!("{:#x}", status.to_u16());
    map.get("errors")?.get(&key)?.get("desc")?.as_str().map(str::to_string)
}

/// Issues `SASLList`, selects a mechanism, then drives `SASLAuth`/`SASLStep` to
/// completion (§4.3). `force_sasl_plain` restricts the candidate list to PLAIN.
/// `error_map`, when the caller already retrieved one via `get_error_map`, enriches
/// any `ServerStatus` error this exchange produces.
pub async fn authenticate(
    transport: &mut Transport,
    username: &str,
    password: &str,
    force_sasl_plain: bool,
    error_map: Option<&Bytes>,
) -> Result<()> {
    let list_request = Frame::request(Opcode::SaslList, 0, 0, 0);
    let list_response = roundtrip(transport, list_request).await?;
    check_status(&list_response, Opcode::SaslList, error_map)?;
    let offered = String::from_utf8_lossy(&list_response.value).to_string();

    let mechanism = Mechanism::select(&offered, force_sasl_plain)
        .ok_or_else(|| CoreError::SaslRejected(format!("no compatible SASL mechanism in '{offered}'")))?;

    if mechanism == Mechanism::Plain {
        let mut auth_request = Frame::request(Opcode::SaslAuth, 0, 0, 0);
        auth_request.key = Bytes::from_static(mechanism.wire_name().as_bytes());
        auth_request.value = Bytes::from(plain_message(username, password));
        let response = roundtrip(transport, auth_request).await?;
        return check_status(&response, Opcode::SaslAuth, error_map);
    }

    let client = ScramClient::new(mechanism, username, password);
    let mut auth_request = Frame::request(Opcode::SaslAuth, 0, 0, 0);
    auth_request.key = Bytes::from_static(mechanism.wire_name().as_bytes());
    auth_request.value = Bytes::from(client.client_first_message());
    let first_response = roundtrip(transport, auth_request).await?;

    // A SCRAM-capable server typically answers the client-first message with a
    // continuation status (not Success) carrying the server-first message; only
    // bail out early if it has already fully succeeded.
    if first_response.status() == Some(Status::Success) {
        return Ok(());
    }

    let (final_message, expected_signature) = client.client_final_message(&first_response.value)?;
    let mut step_request = Frame::request(Opcode::SaslStep, 0, 0, 0);
    step_request.key = Bytes::from_static(mechanism.wire_name().as_bytes());
    step_request.value = Bytes::from(final_message);
    let step_response = roundtrip(transport, step_request).await?;
    check_status(&step_response, Opcode::SaslStep, error_map)?;

    let server_final = String::from_utf8_lossy(&step_response.value);
    if let Some(v) = server_final.strip_prefix("v=") {
        if v != expected_signature {
            warn!("SCRAM server signature mismatch; server identity not confirmed");
            return Err(CoreError::SaslRejected("server signature verification failed".into()));
        }
    }
    Ok(())
}

pub async fn select_bucket(transport: &mut Transport, bucket: &str, error_map: Option<&Bytes>) -> Result<()> {
    let mut request = Frame::request(Opcode::SelectBucket, 0, 0, 0);
    request.key = Bytes::copy_from_slice(bucket.as_bytes());
    let response = roundtrip(transport, request).await?;
    check_status(&response, Opcode::SelectBucket, error_map)
}

fn check_status(response: &Frame, opcode: Opcode, error_map: Option<&Bytes>) -> Result<()> {
    match response.status() {
        Some(Status::Success) => Ok(()),
        Some(Status::AuthError) => Err(CoreError::SaslRejected(format!("{opcode:?} rejected"))),
        Some(status) => Err(CoreError::ServerStatus {
            status,
            error_map_text: error_map.and_then(|m| lookup_error_text(m, status)),
        }),
        None => Err(CoreError::Internal("handshake reply was not a response frame".into())),
    }
}
